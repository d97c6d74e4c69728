//! Dependency-graph algorithms over a subtask list
//!
//! All functions take the subtasks in decomposition order. Dependencies that
//! point outside the list are ignored here; [`validate`] reports them.

use nova_core::{NovaError, Result, Subtask, TaskId};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Longest dependency chain, from its root to its deepest subtask
///
/// Depth of a subtask is the number of subtasks on the longest chain ending
/// at it. The walk back starts at the deepest subtask (first one wins on
/// ties) and at each step follows the first listed dependency. Templates list
/// the chaining dependency first, so the walk stays on the longest chain.
/// Dependencies outside the list, or already on the path, are passed over.
pub fn critical_path(subtasks: &[Subtask]) -> Vec<TaskId> {
    let index: HashMap<&str, &Subtask> = subtasks.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut depths: HashMap<&str, usize> = HashMap::new();
    let mut visiting: HashSet<&str> = HashSet::new();

    for subtask in subtasks {
        depth_of(subtask.id.as_str(), &index, &mut depths, &mut visiting);
    }

    let mut current = match subtasks
        .iter()
        .map(|s| (s, depths.get(s.id.as_str()).copied().unwrap_or(1)))
        .fold(None, |best: Option<(&Subtask, usize)>, (s, d)| match best {
            Some((_, best_depth)) if best_depth >= d => best,
            _ => Some((s, d)),
        }) {
        Some((subtask, _)) => subtask,
        None => return Vec::new(),
    };

    let mut path = vec![current.id.clone()];
    let mut seen: HashSet<&str> = HashSet::from([current.id.as_str()]);

    loop {
        let next = current
            .dependencies
            .iter()
            .filter_map(|dep| index.get(dep.as_str()).copied())
            .find(|dep| !seen.contains(dep.id.as_str()));

        match next {
            Some(dep) => {
                seen.insert(dep.id.as_str());
                path.push(dep.id.clone());
                current = dep;
            }
            None => break,
        }
    }

    path.reverse();
    path
}

fn depth_of<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a Subtask>,
    depths: &mut HashMap<&'a str, usize>,
    visiting: &mut HashSet<&'a str>,
) -> usize {
    if let Some(depth) = depths.get(id) {
        return *depth;
    }
    let Some(&subtask) = index.get(id) else {
        return 0;
    };
    // A cycle contributes nothing; validate() reports it separately
    if !visiting.insert(id) {
        return 0;
    }

    let deepest_dependency = subtask
        .dependencies
        .iter()
        .map(|dep| depth_of(dep.as_str(), index, depths, visiting))
        .max()
        .unwrap_or(0);

    visiting.remove(id);
    let depth = deepest_dependency + 1;
    depths.insert(id, depth);
    depth
}

/// Groups of subtasks that can run side by side
///
/// Every `order` bucket holding more than one subtask becomes a group,
/// in ascending order.
pub fn parallel_groups(subtasks: &[Subtask]) -> Vec<Vec<TaskId>> {
    let mut buckets: BTreeMap<u32, Vec<TaskId>> = BTreeMap::new();
    for subtask in subtasks {
        buckets
            .entry(subtask.order)
            .or_default()
            .push(subtask.id.clone());
    }

    buckets
        .into_values()
        .filter(|group| group.len() > 1)
        .collect()
}

/// Topological levels: each wave depends only on earlier waves
pub fn execution_waves(subtasks: &[Subtask]) -> Vec<Vec<TaskId>> {
    let nodes: Vec<(&str, &[TaskId])> = subtasks
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();
    dependency_waves(&nodes)
}

/// Topological levels over `(id, dependencies)` pairs
///
/// Within a wave, nodes keep their input order. Dependencies on ids not in
/// `nodes` are treated as satisfied. Nodes on a cycle appear in no wave.
pub fn dependency_waves(nodes: &[(&str, &[TaskId])]) -> Vec<Vec<TaskId>> {
    let known: HashSet<&str> = nodes.iter().map(|(id, _)| *id).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut waves = Vec::new();

    while placed.len() < nodes.len() {
        let wave: Vec<&str> = nodes
            .iter()
            .filter(|(id, _)| !placed.contains(id))
            .filter(|(_, deps)| {
                deps.iter()
                    .all(|dep| placed.contains(dep.as_str()) || !known.contains(dep.as_str()))
            })
            .map(|(id, _)| *id)
            .collect();

        // Whatever remains sits on a cycle
        if wave.is_empty() {
            break;
        }

        placed.extend(wave.iter().copied());
        waves.push(wave.into_iter().map(str::to_string).collect());
    }

    waves
}

/// Check that every dependency resolves and the graph is acyclic
pub fn validate(subtasks: &[Subtask]) -> Result<()> {
    let mut ids = HashSet::new();
    for subtask in subtasks {
        if !ids.insert(subtask.id.as_str()) {
            return Err(NovaError::Decomposition(format!(
                "duplicate subtask id {}",
                subtask.id
            )));
        }
    }

    for subtask in subtasks {
        if let Some(missing) = subtask
            .dependencies
            .iter()
            .find(|dep| !ids.contains(dep.as_str()))
        {
            return Err(NovaError::Decomposition(format!(
                "subtask {} depends on unknown subtask {}",
                subtask.id, missing
            )));
        }
    }

    let placed: usize = execution_waves(subtasks).iter().map(Vec::len).sum();
    if placed < subtasks.len() {
        return Err(NovaError::Decomposition(
            "dependency cycle between subtasks".to_string(),
        ));
    }

    Ok(())
}

//! Decomposed task plans and subtask scheduling

use crate::complexity::ComplexityEstimate;
use crate::graph;
use nova_core::{NovaError, Result, Subtask, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A task expanded into a dependency-linked set of subtasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecomposedTask {
    pub parent_id: TaskId,
    pub subtasks: Vec<Subtask>,
    /// Longest dependency chain, root first
    pub critical_path: Vec<TaskId>,
    /// Groups whose members share no dependency edge
    pub parallelizable: Vec<Vec<TaskId>>,
    /// Sum of every subtask duration, in minutes
    pub total_estimated_duration: u32,
    pub complexity: ComplexityEstimate,
}

impl DecomposedTask {
    /// Build a plan from generated subtasks, computing the derived fields
    pub fn new(parent_id: impl Into<String>, subtasks: Vec<Subtask>, complexity: ComplexityEstimate) -> Self {
        let critical_path = graph::critical_path(&subtasks);
        let parallelizable = graph::parallel_groups(&subtasks);
        let total_estimated_duration = subtasks.iter().map(|s| s.estimated_minutes).sum();

        Self {
            parent_id: parent_id.into(),
            subtasks,
            critical_path,
            parallelizable,
            total_estimated_duration,
            complexity,
        }
    }

    /// Wrap a task that runs directly as a one-subtask plan
    pub fn single(task: &Task, complexity: ComplexityEstimate) -> Self {
        let complexity_tier = nova_core::Complexity::Simple;
        let subtask = Subtask {
            id: task.id.clone(),
            parent_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            agent: task.agent,
            status: TaskStatus::Ready,
            dependencies: Vec::new(),
            phase: task.phase,
            attempts: task.attempts,
            complexity: complexity_tier,
            estimated_minutes: complexity_tier.minutes(),
            order: 1,
            output: None,
            error: None,
        };
        Self::new(task.id.clone(), vec![subtask], complexity)
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Subtasks that are ready and whose dependencies have all completed
    pub fn ready_subtasks(&self) -> Vec<&Subtask> {
        self.subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Ready)
            .filter(|s| {
                s.dependencies.iter().all(|dep| {
                    self.subtask(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Update the status of one subtask
    pub fn mark_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let subtask = self
            .subtask_mut(id)
            .ok_or_else(|| NovaError::Decomposition(format!("unknown subtask {}", id)))?;
        subtask.status = status;
        Ok(())
    }

    /// Fail every subtask that transitively depends on `id`
    ///
    /// Returns the ids that were failed, in decomposition order.
    pub fn fail_dependents(&mut self, id: &str) -> Vec<TaskId> {
        let mut blocked: HashSet<TaskId> = HashSet::from([id.to_string()]);
        let mut failed = Vec::new();

        loop {
            let newly: Vec<TaskId> = self
                .subtasks
                .iter()
                .filter(|s| !blocked.contains(&s.id))
                .filter(|s| s.dependencies.iter().any(|dep| blocked.contains(dep)))
                .map(|s| s.id.clone())
                .collect();
            if newly.is_empty() {
                break;
            }
            blocked.extend(newly);
        }

        for subtask in &mut self.subtasks {
            if subtask.id != id && blocked.contains(&subtask.id) && subtask.status != TaskStatus::Failed {
                subtask.status = TaskStatus::Failed;
                subtask.error = Some(format!("blocked by failed subtask {}", id));
                failed.push(subtask.id.clone());
            }
        }

        failed
    }

    /// True once no subtask is ready or in progress
    pub fn is_complete(&self) -> bool {
        self.subtasks
            .iter()
            .all(|s| matches!(s.status, TaskStatus::Completed | TaskStatus::Failed))
    }

    pub fn has_failures(&self) -> bool {
        self.subtasks.iter().any(|s| s.status == TaskStatus::Failed)
    }

    /// Duration along the critical path, in minutes
    pub fn critical_path_duration(&self) -> u32 {
        self.critical_path
            .iter()
            .filter_map(|id| self.subtask(id))
            .map(|s| s.estimated_minutes)
            .sum()
    }

    /// Topological waves of subtask ids
    pub fn execution_waves(&self) -> Vec<Vec<TaskId>> {
        graph::execution_waves(&self.subtasks)
    }

    /// Check dependency references and acyclicity
    pub fn validate(&self) -> Result<()> {
        graph::validate(&self.subtasks)
    }

    pub fn summary(&self) -> DecompositionSummary {
        DecompositionSummary {
            parent_id: self.parent_id.clone(),
            total_subtasks: self.subtasks.len(),
            total_minutes: self.total_estimated_duration,
            critical_path_minutes: self.critical_path_duration(),
            risk: self.complexity.risk.to_string(),
            subtasks: self
                .subtasks
                .iter()
                .map(|s| SubtaskInfo {
                    id: s.id.clone(),
                    agent: s.agent.to_string(),
                    title: s.title.clone(),
                    order: s.order,
                    dependencies: s.dependencies.clone(),
                })
                .collect(),
            critical_path: self.critical_path.clone(),
            parallel_groups: self.parallelizable.clone(),
        }
    }
}

/// Summary of decomposition results
#[derive(Debug, Clone)]
pub struct DecompositionSummary {
    pub parent_id: TaskId,
    pub total_subtasks: usize,
    pub total_minutes: u32,
    pub critical_path_minutes: u32,
    pub risk: String,
    pub subtasks: Vec<SubtaskInfo>,
    pub critical_path: Vec<TaskId>,
    pub parallel_groups: Vec<Vec<TaskId>>,
}

/// Subtask line for summary
#[derive(Debug, Clone)]
pub struct SubtaskInfo {
    pub id: TaskId,
    pub agent: String,
    pub title: String,
    pub order: u32,
    pub dependencies: Vec<TaskId>,
}

impl std::fmt::Display for DecompositionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Task: {}", self.parent_id)?;
        writeln!(f, "  Risk: {}", self.risk)?;
        writeln!(f, "  Subtasks: {}", self.total_subtasks)?;
        writeln!(f, "  Estimated: {} min", self.total_minutes)?;
        writeln!(f, "  Critical path: {} min", self.critical_path_minutes)?;
        writeln!(f)?;
        writeln!(f, "Subtasks:")?;
        for subtask in &self.subtasks {
            let deps = if subtask.dependencies.is_empty() {
                String::new()
            } else {
                format!(" (after {})", subtask.dependencies.join(", "))
            };
            writeln!(
                f,
                "  [{}] {} {} - {}{}",
                subtask.order, subtask.id, subtask.agent, subtask.title, deps
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Critical path: {}", self.critical_path.join(" -> "))?;
        for group in &self.parallel_groups {
            writeln!(f, "Parallel: {}", group.join(", "))?;
        }
        Ok(())
    }
}

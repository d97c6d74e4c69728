//! Task decomposition into agent-assigned subtasks
//!
//! The description is scanned for domain categories; every matched category
//! contributes a fixed template of subtasks. `order` encodes sequencing and
//! every dependency points at a strictly lower order, so subtasks sharing an
//! order never depend on one another.

use crate::complexity::{analyze_complexity, RiskLevel};
use crate::plan::DecomposedTask;
use nova_core::{Agent, Complexity, Subtask, TaskId, TaskStatus};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, instrument};

/// Domain categories recognised in task descriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Schema,
    Api,
    Integration,
    Ui,
    Testing,
}

impl Category {
    const ALL: [Category; 5] = [
        Category::Schema,
        Category::Api,
        Category::Integration,
        Category::Ui,
        Category::Testing,
    ];

    fn pattern(&self) -> &'static str {
        match self {
            Self::Schema => r"\b(schema|database|db|tables?|migrations?)\b",
            Self::Api => r"\b(api|apis|backend|endpoints?|server)\b",
            Self::Integration => r"\b(integrations?|integrate|webhooks?|third[- ]party|oauth)\b",
            Self::Ui => r"\b(ui|components?|pages?|frontend|screens?|forms?|dashboard)\b",
            Self::Testing => r"\b(tests?|testing|coverage)\b",
        }
    }

    /// Categories mentioned in `text`, in template order
    pub fn detect(text: &str) -> Vec<Category> {
        static MATCHERS: OnceLock<Vec<(Category, Regex)>> = OnceLock::new();
        let matchers = MATCHERS.get_or_init(|| {
            Category::ALL
                .iter()
                .filter_map(|c| Regex::new(c.pattern()).ok().map(|re| (*c, re)))
                .collect()
        });

        let lower = text.to_lowercase();
        matchers
            .iter()
            .filter(|(_, re)| re.is_match(&lower))
            .map(|(c, _)| *c)
            .collect()
    }
}

/// Decomposes tasks into subtask graphs
pub struct TaskDecomposer;

impl TaskDecomposer {
    /// Expand a task into subtasks with dependencies, critical path and
    /// parallel groups
    ///
    /// Never fails: a description without recognised categories (including
    /// an empty one) yields the generic analyze/design/implement/validate
    /// template.
    #[instrument(skip(title, description))]
    pub fn decompose_task(
        parent_id: &str,
        title: &str,
        description: &str,
        agent: Agent,
    ) -> DecomposedTask {
        let complexity = analyze_complexity(title, description);
        let categories = Category::detect(description);
        debug!("Detected categories: {:?}", categories);

        let mut builder = SubtaskBuilder::new(parent_id, title);

        if categories.is_empty() {
            builder.generic(agent);
        } else {
            let mut group_roots: Vec<TaskId> = Vec::new();
            let mut schema_design: Option<TaskId> = None;

            for category in &categories {
                match category {
                    Category::Schema => {
                        let design = builder.push(
                            "Design schema",
                            "Design tables, fields, relations and indexes",
                            Agent::Pluto,
                            Complexity::Medium,
                            1,
                            Vec::new(),
                        );
                        builder.push(
                            "Implement schema and queries",
                            "Implement the schema definition and its queries",
                            Agent::Pluto,
                            Complexity::Medium,
                            2,
                            vec![design.clone()],
                        );
                        builder.push(
                            "Secure data access rules",
                            "Add authorization and validation around data access",
                            Agent::Enceladus,
                            Complexity::Simple,
                            3,
                            vec![design.clone()],
                        );
                        schema_design = Some(design.clone());
                        group_roots.push(design);
                    }
                    Category::Api => {
                        let contract = builder.push(
                            "Define API contract",
                            "Define request/response shapes and endpoint boundaries",
                            Agent::Jupiter,
                            Complexity::Simple,
                            1,
                            Vec::new(),
                        );
                        let mut deps = vec![contract.clone()];
                        deps.extend(schema_design.clone());
                        builder.push(
                            "Implement API endpoints",
                            "Implement the endpoints and business logic",
                            Agent::Mars,
                            Complexity::Complex,
                            2,
                            deps,
                        );
                        builder.push(
                            "Add API error handling",
                            "Handle failures and surface errors to callers",
                            Agent::Charon,
                            Complexity::Simple,
                            3,
                            vec![contract.clone()],
                        );
                        group_roots.push(contract);
                    }
                    Category::Integration => {
                        let design = builder.push(
                            "Design integration",
                            "Design the external integration and its failure modes",
                            Agent::Ganymede,
                            Complexity::Medium,
                            1,
                            Vec::new(),
                        );
                        builder.push(
                            "Implement integration handlers",
                            "Implement webhook and client handlers with retries",
                            Agent::Ganymede,
                            Complexity::Complex,
                            2,
                            vec![design.clone()],
                        );
                        group_roots.push(design);
                    }
                    Category::Ui => {
                        let design = builder.push(
                            "Design component structure",
                            "Design the component tree and data flow",
                            Agent::Venus,
                            Complexity::Simple,
                            1,
                            Vec::new(),
                        );
                        builder.push(
                            "Implement UI components",
                            "Implement the components and layout",
                            Agent::Venus,
                            Complexity::Complex,
                            2,
                            vec![design.clone()],
                        );
                        builder.push(
                            "Implement loading/empty/error states",
                            "Cover loading, empty, error, partial and populated states",
                            Agent::Charon,
                            Complexity::Simple,
                            3,
                            vec![design.clone()],
                        );
                        group_roots.push(design);
                    }
                    Category::Testing => {
                        builder.push(
                            "Write tests",
                            "Write unit and integration tests for the delivered work",
                            Agent::Saturn,
                            Complexity::Medium,
                            4,
                            group_roots.clone(),
                        );
                    }
                }
            }

            if complexity.risk == RiskLevel::High {
                let first = builder.first_id();
                builder.push(
                    "Document design decisions",
                    "Record the design decisions and operational notes",
                    Agent::Callisto,
                    Complexity::Simple,
                    5,
                    first.into_iter().collect(),
                );
            }
        }

        let plan = DecomposedTask::new(parent_id, builder.finish(), complexity);
        info!(
            "Decomposed {} into {} subtasks ({} min, critical path {} min)",
            parent_id,
            plan.subtasks.len(),
            plan.total_estimated_duration,
            plan.critical_path_duration()
        );
        plan
    }
}

/// Accumulates subtasks with sequential ids
struct SubtaskBuilder<'a> {
    parent_id: &'a str,
    title: &'a str,
    subtasks: Vec<Subtask>,
}

impl<'a> SubtaskBuilder<'a> {
    fn new(parent_id: &'a str, title: &'a str) -> Self {
        Self {
            parent_id,
            title,
            subtasks: Vec::new(),
        }
    }

    fn push(
        &mut self,
        name: &str,
        detail: &str,
        agent: Agent,
        complexity: Complexity,
        order: u32,
        dependencies: Vec<TaskId>,
    ) -> TaskId {
        let id = format!("{}-{}", self.parent_id, self.subtasks.len() + 1);
        self.subtasks.push(Subtask {
            id: id.clone(),
            parent_id: self.parent_id.to_string(),
            title: format!("{}: {}", name, self.title),
            description: detail.to_string(),
            agent,
            status: TaskStatus::Ready,
            dependencies,
            phase: order,
            attempts: 0,
            complexity,
            estimated_minutes: complexity.minutes(),
            order,
            output: None,
            error: None,
        });
        id
    }

    fn generic(&mut self, agent: Agent) {
        let analyze = self.push(
            "Analyze requirements",
            "Clarify scope and acceptance criteria",
            Agent::Earth,
            Complexity::Simple,
            1,
            Vec::new(),
        );
        let design = self.push(
            "Design solution",
            "Design the approach and interfaces",
            Agent::Jupiter,
            Complexity::Medium,
            2,
            vec![analyze],
        );
        let implement = self.push(
            "Implement solution",
            "Implement the designed solution",
            agent,
            Complexity::Complex,
            3,
            vec![design],
        );
        self.push(
            "Validate implementation",
            "Verify the implementation against the requirements",
            Agent::Mercury,
            Complexity::Simple,
            4,
            vec![implement],
        );
    }

    fn first_id(&self) -> Option<TaskId> {
        self.subtasks.first().map(|s| s.id.clone())
    }

    fn finish(self) -> Vec<Subtask> {
        self.subtasks
    }
}

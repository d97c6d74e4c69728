//! Core type definitions for Nova builds

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Agents that take part in a build
///
/// The set is closed: every lookup keyed by agent (hard limits, gate
/// profiles, decomposition templates) matches exhaustively on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Agent {
    /// Build orchestration
    Sun,
    /// Product specification
    Earth,
    /// Architecture and API contracts
    Jupiter,
    /// Database schema
    Pluto,
    /// Backend implementation
    Mars,
    /// UI and components
    Venus,
    /// Validation
    Mercury,
    /// Testing
    Saturn,
    /// Security
    Enceladus,
    /// Third-party integrations
    Ganymede,
    /// Error and fallback UX
    Charon,
    /// Documentation
    Callisto,
    /// Analytics
    Neptune,
    /// Real-time features
    Titan,
    /// Performance
    Io,
    /// Resilience
    Mimas,
    /// DevOps
    Triton,
    /// Mobile
    Europa,
    /// Research
    Uranus,
    /// Learning
    Atlas,
    /// Ideation
    Andromeda,
}

/// Static capabilities used by validation gates
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    /// Structural tags a well-formed response from this agent contains
    pub expected_tags: &'static [&'static str],
    /// Fields required in the agent's embedded JSON output, if it emits one
    pub schema_fields: &'static [&'static str],
    /// Domain words used by the deterministic semantic fallback
    pub keywords: &'static [&'static str],
}

impl Agent {
    pub const ALL: [Agent; 21] = [
        Agent::Sun,
        Agent::Earth,
        Agent::Jupiter,
        Agent::Pluto,
        Agent::Mars,
        Agent::Venus,
        Agent::Mercury,
        Agent::Saturn,
        Agent::Enceladus,
        Agent::Ganymede,
        Agent::Charon,
        Agent::Callisto,
        Agent::Neptune,
        Agent::Titan,
        Agent::Io,
        Agent::Mimas,
        Agent::Triton,
        Agent::Europa,
        Agent::Uranus,
        Agent::Atlas,
        Agent::Andromeda,
    ];

    /// Uppercase label used in configuration files and prompts
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sun => "SUN",
            Self::Earth => "EARTH",
            Self::Jupiter => "JUPITER",
            Self::Pluto => "PLUTO",
            Self::Mars => "MARS",
            Self::Venus => "VENUS",
            Self::Mercury => "MERCURY",
            Self::Saturn => "SATURN",
            Self::Enceladus => "ENCELADUS",
            Self::Ganymede => "GANYMEDE",
            Self::Charon => "CHARON",
            Self::Callisto => "CALLISTO",
            Self::Neptune => "NEPTUNE",
            Self::Titan => "TITAN",
            Self::Io => "IO",
            Self::Mimas => "MIMAS",
            Self::Triton => "TRITON",
            Self::Europa => "EUROPA",
            Self::Uranus => "URANUS",
            Self::Atlas => "ATLAS",
            Self::Andromeda => "ANDROMEDA",
        }
    }

    pub fn profile(&self) -> AgentProfile {
        match self {
            Self::Pluto => AgentProfile {
                expected_tags: &["schema", "indexes"],
                schema_fields: &["tables"],
                keywords: &["table", "schema", "index", "field", "query"],
            },
            Self::Mars => AgentProfile {
                expected_tags: &["implementation", "summary"],
                schema_fields: &[],
                keywords: &["function", "endpoint", "mutation", "handler", "return"],
            },
            Self::Venus => AgentProfile {
                expected_tags: &["component", "states"],
                schema_fields: &[],
                keywords: &["component", "render", "props", "layout", "style"],
            },
            Self::Jupiter => AgentProfile {
                expected_tags: &["architecture", "decisions"],
                schema_fields: &["components", "decisions"],
                keywords: &["architecture", "contract", "interface", "module", "boundary"],
            },
            Self::Earth => AgentProfile {
                expected_tags: &["requirements"],
                schema_fields: &["requirements"],
                keywords: &["requirement", "user", "story", "acceptance", "scope"],
            },
            Self::Saturn => AgentProfile {
                expected_tags: &["tests"],
                schema_fields: &[],
                keywords: &["test", "assert", "expect", "coverage", "case"],
            },
            Self::Enceladus => AgentProfile {
                expected_tags: &["threats", "mitigations"],
                schema_fields: &[],
                keywords: &["auth", "permission", "validate", "sanitize", "access"],
            },
            Self::Ganymede => AgentProfile {
                expected_tags: &["integration"],
                schema_fields: &["endpoints"],
                keywords: &["webhook", "api", "client", "retry", "signature"],
            },
            Self::Charon => AgentProfile {
                expected_tags: &["states"],
                schema_fields: &[],
                keywords: &["error", "fallback", "empty", "loading", "retry"],
            },
            Self::Callisto => AgentProfile {
                expected_tags: &[],
                schema_fields: &[],
                keywords: &["document", "guide", "example", "usage", "decision"],
            },
            Self::Mercury => AgentProfile {
                expected_tags: &["verdict"],
                schema_fields: &[],
                keywords: &["pass", "fail", "issue", "check", "valid"],
            },
            Self::Sun
            | Self::Neptune
            | Self::Titan
            | Self::Io
            | Self::Mimas
            | Self::Triton
            | Self::Europa
            | Self::Uranus
            | Self::Atlas
            | Self::Andromeda => AgentProfile {
                expected_tags: &[],
                schema_fields: &[],
                keywords: &[],
            },
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|agent| agent.label() == upper)
            .ok_or_else(|| format!("Invalid agent: {}", s))
    }
}

/// Task status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ready" => Ok(Self::Ready),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Estimated complexity tier of a subtask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl Complexity {
    /// Estimated duration in minutes
    pub fn minutes(&self) -> u32 {
        match self {
            Self::Simple => 10,
            Self::Medium => 20,
            Self::Complex => 40,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Medium => write!(f, "medium"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Task identifier
pub type TaskId = String;

/// A top-level unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub agent: Agent,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        agent: Agent,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            agent,
            status: TaskStatus::Ready,
            dependencies: Vec::new(),
            phase: 0,
            attempts: 0,
            context: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    /// Attach a free-form context value
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Look up a context value
    pub fn context_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.as_ref().and_then(|ctx| ctx.get(key))
    }
}

/// A unit of work produced by decomposing a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: TaskId,
    pub parent_id: TaskId,
    pub title: String,
    pub description: String,
    pub agent: Agent,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub attempts: u32,
    pub complexity: Complexity,
    pub estimated_minutes: u32,
    /// Parallel bucket; subtasks sharing an order have no edges between them
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Subtask {
    /// View this subtask as a plain task (for gates, hooks and approval)
    pub fn to_task(&self) -> Task {
        Task {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            agent: self.agent,
            status: self.status,
            dependencies: self.dependencies.clone(),
            phase: self.phase,
            attempts: self.attempts,
            context: None,
        }
    }
}

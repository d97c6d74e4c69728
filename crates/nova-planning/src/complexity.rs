//! Complexity estimation for incoming tasks

use serde::{Deserialize, Serialize};

/// Keywords that mark a point where the task touches another system
const INTEGRATION_KEYWORDS: &[&str] = &[
    "database",
    "schema",
    "api",
    "endpoint",
    "webhook",
    "integration",
    "auth",
    "payment",
    "stripe",
    "oauth",
    "third-party",
    "external",
    "realtime",
    "websocket",
    "queue",
    "email",
];

/// Risk tier of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Rough size and risk estimate for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityEstimate {
    /// Approximate generated-code volume
    pub estimated_lines: u32,
    /// Approximate number of files touched
    pub estimated_files: u32,
    /// Distinct integration keywords found
    pub integration_points: u32,
    pub risk: RiskLevel,
    pub recommended_subtasks: u32,
}

/// Estimate the complexity of a task from its title and description
pub fn analyze_complexity(title: &str, description: &str) -> ComplexityEstimate {
    let text = format!("{} {}", title, description).to_lowercase();
    let words = text.split_whitespace().count() as u32;

    let integration_points = INTEGRATION_KEYWORDS
        .iter()
        .filter(|keyword| text.contains(*keyword))
        .count() as u32;

    let estimated_lines = 50 + words * 12 + integration_points * 80;
    let estimated_files = estimated_lines.div_ceil(150);

    let risk = if integration_points >= 3 || estimated_files >= 5 {
        RiskLevel::High
    } else if integration_points >= 1 || estimated_files >= 3 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };

    let recommended_subtasks = (1 + integration_points + estimated_files / 2).clamp(1, 8);

    ComplexityEstimate {
        estimated_lines,
        estimated_files,
        integration_points,
        risk,
        recommended_subtasks,
    }
}

/// Whether a task should be expanded into subtasks rather than run directly
pub fn should_decompose(title: &str, description: &str) -> bool {
    let estimate = analyze_complexity(title, description);
    estimate.risk != RiskLevel::Low || estimate.integration_points >= 2
}

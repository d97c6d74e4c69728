//! Nova Planning - task decomposition and scheduling
//!
//! This crate estimates task complexity, decides whether a task should be
//! expanded, and turns it into an agent-assigned subtask graph with a
//! critical path and parallel groups. Everything here is pure computation.

pub mod complexity;
pub mod decomposer;
pub mod graph;
pub mod plan;

pub use complexity::{analyze_complexity, should_decompose, ComplexityEstimate, RiskLevel};
pub use decomposer::{Category, TaskDecomposer};
pub use plan::{DecomposedTask, DecompositionSummary, SubtaskInfo};

//! # nova-validation
//!
//! Quality gates for agent responses.
//!
//! This crate provides:
//! - Agent-scoped hard limits loaded from JSON
//! - The gate pipeline (response, structure, schema, sandbox, semantic)
//! - Contracts for the LLM client and the code sandbox

pub mod gates;
pub mod hard_limits;
mod llm;
pub mod sandbox;

pub use gates::{all_gates_passed, gates_summary, quality_score, GateResult, GateRunner, GatesSummary};
pub use hard_limits::{CustomCheck, HardLimit, HardLimitViolation, HardLimits, LimitRule, Severity};
pub use llm::LlmClient;
pub use sandbox::{extract_code_blocks, CodeBlock, Sandbox, SandboxReport};

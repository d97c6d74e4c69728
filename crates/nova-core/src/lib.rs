//! # nova-core
//!
//! Core types for the Nova multi-agent build pipeline.
//!
//! A build takes top-level tasks, decomposes them into dependency-linked
//! subtasks, validates every subtask result through quality gates, optionally
//! routes plans through human approval, and hands control between agents
//! with a structured payload.
//!
//! This crate holds what every other Nova crate shares:
//! - the task/subtask data model and the closed [`Agent`] set
//! - [`NovaError`] and the [`Result`] alias
//! - repository configuration ([`NovaConfig`])
//! - fail-open helpers and feature-flag lookup

pub mod config;
mod error;
pub mod fail_open;
pub mod flags;
mod types;

pub use config::{
    ApprovalConfig, BuildConfig, GateKind, GatesConfig, NovaConfig, AUTONOMY_ENV,
    DEFAULT_AUTONOMY_LEVEL,
};
pub use error::{NovaError, Result};
pub use flags::{module_enabled, FlagStore, StaticFlags};
pub use types::*;

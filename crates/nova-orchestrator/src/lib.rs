//! # nova-orchestrator
//!
//! Coordination substrate for Nova builds.
//!
//! This crate provides:
//! - Lifecycle hook registry with fail-open dispatch
//! - Handoff payloads assembled from module collectors
//! - Plan approval over a pluggable transport (file-based by default)
//! - The build orchestrator tying decomposition, gates and hooks together

pub mod approval;
pub mod handoff;
pub mod hooks;
mod orchestrator;

pub use approval::{
    effective_timeout, respond_to_pending, ApprovalOptions, ApprovalResponse, ApprovalResult,
    ApprovalStatus, ApprovalTransport, FileTransport, MemoryTransport, PendingApproval,
    PlanApprovalCoordinator, ResponseKind,
};
pub use handoff::{CollectorArgs, HandoffContextBuilder, HandoffParams, HandoffPayload, HandoffSlot};
pub use hooks::{
    BuildCompleteContext, BuildStartContext, FnHandler, HandoffContext, HookModule, HookRegistry,
    HookSpec, LifecycleHandler, LifecycleHook, LifecyclePhase, PhaseContext, PhaseReport,
    TaskOutcome, TaskStartContext,
};
pub use orchestrator::{BuildOrchestrator, BuildSummary, SubtaskReport};

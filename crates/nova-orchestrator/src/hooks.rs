//! Lifecycle hook registry
//!
//! External modules (memory store, model router, observability) register
//! handlers against the six build phases. Dispatch is fail-open: a handler
//! that errors or panics is logged and counted, and the remaining handlers
//! for the phase still run.

use crate::handoff::HandoffPayload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nova_core::fail_open::fail_open;
use nova_core::{module_enabled, Agent, FlagStore, NovaConfig, Result, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Points in a build at which hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    #[serde(rename = "onBeforeBuild")]
    BeforeBuild,
    #[serde(rename = "onBeforeTask")]
    BeforeTask,
    #[serde(rename = "onAfterTask")]
    AfterTask,
    #[serde(rename = "onTaskError")]
    TaskError,
    #[serde(rename = "onHandoff")]
    Handoff,
    #[serde(rename = "onBuildComplete")]
    BuildComplete,
}

impl LifecyclePhase {
    pub const ALL: [LifecyclePhase; 6] = [
        LifecyclePhase::BeforeBuild,
        LifecyclePhase::BeforeTask,
        LifecyclePhase::AfterTask,
        LifecyclePhase::TaskError,
        LifecyclePhase::Handoff,
        LifecyclePhase::BuildComplete,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeBuild => "onBeforeBuild",
            Self::BeforeTask => "onBeforeTask",
            Self::AfterTask => "onAfterTask",
            Self::TaskError => "onTaskError",
            Self::Handoff => "onHandoff",
            Self::BuildComplete => "onBuildComplete",
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Context for `onBeforeBuild`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStartContext {
    pub build_id: String,
    pub spec_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Context for `onBeforeTask`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartContext {
    pub task_id: TaskId,
    pub title: String,
    pub agent: Agent,
    pub dependencies: Vec<TaskId>,
}

/// Context for `onAfterTask` and `onTaskError`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub agent: Agent,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
}

/// Context for `onHandoff`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffContext {
    pub from: Agent,
    pub to: Agent,
    pub task_id: TaskId,
    pub payload: HandoffPayload,
}

/// Context for `onBuildComplete`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompleteContext {
    pub build_id: String,
    pub spec_id: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_quality: f32,
}

/// Typed context handed to the handlers of one phase
///
/// The variant decides the phase, so a context cannot reach the wrong one.
#[derive(Debug, Clone)]
pub enum PhaseContext {
    BeforeBuild(BuildStartContext),
    BeforeTask(TaskStartContext),
    AfterTask(TaskOutcome),
    TaskError(TaskOutcome),
    Handoff(HandoffContext),
    BuildComplete(BuildCompleteContext),
}

impl PhaseContext {
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            Self::BeforeBuild(_) => LifecyclePhase::BeforeBuild,
            Self::BeforeTask(_) => LifecyclePhase::BeforeTask,
            Self::AfterTask(_) => LifecyclePhase::AfterTask,
            Self::TaskError(_) => LifecyclePhase::TaskError,
            Self::Handoff(_) => LifecyclePhase::Handoff,
            Self::BuildComplete(_) => LifecyclePhase::BuildComplete,
        }
    }
}

/// Handler invoked for a phase
///
/// Errors are logged by the registry and never reach the build.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    async fn handle(&self, context: &PhaseContext) -> Result<()>;
}

/// Adapts a synchronous closure into a [`LifecycleHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> LifecycleHandler for FnHandler<F>
where
    F: Fn(&PhaseContext) -> Result<()> + Send + Sync,
{
    async fn handle(&self, context: &PhaseContext) -> Result<()> {
        (self.0)(context)
    }
}

/// A registered hook
#[derive(Clone)]
pub struct LifecycleHook {
    pub id: String,
    pub phase: LifecyclePhase,
    pub module: String,
    /// Lower runs first
    pub priority: i32,
    pub handler: Arc<dyn LifecycleHandler>,
}

impl std::fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("module", &self.module)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Outcome of dispatching one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: LifecyclePhase,
    pub executed: usize,
    pub failed: usize,
}

/// One hook a module wants registered
pub struct HookSpec {
    pub phase: LifecyclePhase,
    pub priority: i32,
    pub handler: Arc<dyn LifecycleHandler>,
}

impl HookSpec {
    pub fn new(phase: LifecyclePhase, priority: i32, handler: impl LifecycleHandler + 'static) -> Self {
        Self {
            phase,
            priority,
            handler: Arc::new(handler),
        }
    }
}

/// An external module that contributes a set of hooks
pub trait HookModule: Send + Sync {
    fn name(&self) -> &str;

    /// Feature flag that gates the module (defaults to its name)
    fn flag(&self) -> &str {
        self.name()
    }

    /// Enablement when neither the flag store nor the config decides
    fn enabled_by_default(&self) -> bool {
        true
    }

    fn hooks(&self) -> Vec<HookSpec>;
}

/// Phase-keyed, priority-ordered hook dispatcher
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<LifecyclePhase, Vec<LifecycleHook>>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and return its id
    ///
    /// Hooks with equal priority keep registration order.
    pub fn register(
        &mut self,
        phase: LifecyclePhase,
        module: impl Into<String>,
        priority: i32,
        handler: Arc<dyn LifecycleHandler>,
    ) -> String {
        self.next_id += 1;
        let hook = LifecycleHook {
            id: format!("hook-{}", self.next_id),
            phase,
            module: module.into(),
            priority,
            handler,
        };
        debug!(
            "Registering {} hook {} for {} (priority {})",
            phase, hook.id, hook.module, priority
        );

        let id = hook.id.clone();
        let hooks = self.hooks.entry(phase).or_default();
        let position = hooks.partition_point(|h| h.priority <= priority);
        hooks.insert(position, hook);
        id
    }

    /// Remove a hook by id
    pub fn unregister(&mut self, id: &str) -> bool {
        for hooks in self.hooks.values_mut() {
            if let Some(position) = hooks.iter().position(|h| h.id == id) {
                hooks.remove(position);
                return true;
            }
        }
        false
    }

    /// Remove every hook a module registered
    pub fn unregister_module(&mut self, module: &str) -> usize {
        let mut removed = 0;
        for hooks in self.hooks.values_mut() {
            let before = hooks.len();
            hooks.retain(|h| h.module != module);
            removed += before - hooks.len();
        }
        removed
    }

    /// Register a module's hooks if its feature flag allows it
    ///
    /// Returns the ids of the registered hooks (empty when disabled).
    pub fn register_module(
        &mut self,
        module: &dyn HookModule,
        flags: &dyn FlagStore,
        config: &NovaConfig,
    ) -> Vec<String> {
        if !module_enabled(flags, config, module.flag(), module.enabled_by_default()) {
            info!("Module {} disabled, skipping hook registration", module.name());
            return Vec::new();
        }

        let ids: Vec<String> = module
            .hooks()
            .into_iter()
            .map(|spec| self.register(spec.phase, module.name(), spec.priority, spec.handler))
            .collect();
        info!("Registered {} hook(s) for module {}", ids.len(), module.name());
        ids
    }

    /// Priority-ordered copy of a phase's hooks
    pub fn get_hooks_for_phase(&self, phase: LifecyclePhase) -> Vec<LifecycleHook> {
        self.hooks.get(&phase).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler of the context's phase, in priority order
    #[instrument(skip(self, context), fields(phase = %context.phase()))]
    pub async fn execute_phase(&self, context: &PhaseContext) -> PhaseReport {
        let phase = context.phase();
        let hooks = self.get_hooks_for_phase(phase);
        let mut failed = 0;

        for hook in &hooks {
            let name = format!("{} hook {} ({})", phase, hook.id, hook.module);
            if fail_open(&name, || hook.handler.handle(context)).await.is_none() {
                failed += 1;
            }
        }

        if failed > 0 {
            warn!("{} of {} {} hook(s) failed", failed, hooks.len(), phase);
        } else if !hooks.is_empty() {
            debug!("Executed {} {} hook(s)", hooks.len(), phase);
        }

        PhaseReport {
            phase,
            executed: hooks.len(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_core::{NovaError, StaticFlags};
    use std::sync::Mutex;

    fn before_task() -> PhaseContext {
        PhaseContext::BeforeTask(TaskStartContext {
            task_id: "t-1".to_string(),
            title: "Design schema".to_string(),
            agent: Agent::Pluto,
            dependencies: Vec::new(),
        })
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> Arc<dyn LifecycleHandler> {
        let log = log.clone();
        let label = label.to_string();
        Arc::new(FnHandler(move |_: &PhaseContext| -> Result<()> {
            log.lock().unwrap().push(label.clone());
            Ok(())
        }))
    }

    #[tokio::test]
    async fn test_priority_order_regardless_of_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(LifecyclePhase::BeforeTask, "a", 300, recorder(&log, "300"));
        registry.register(LifecyclePhase::BeforeTask, "b", 100, recorder(&log, "100"));
        registry.register(LifecyclePhase::BeforeTask, "c", 200, recorder(&log, "200"));

        let report = registry.execute_phase(&before_task()).await;
        assert_eq!(report.executed, 3);
        assert_eq!(*log.lock().unwrap(), vec!["100", "200", "300"]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(LifecyclePhase::BeforeTask, "a", 10, recorder(&log, "first"));
        registry.register(LifecyclePhase::BeforeTask, "b", 10, recorder(&log, "second"));

        registry.execute_phase(&before_task()).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(
            LifecyclePhase::BeforeTask,
            "broken",
            1,
            Arc::new(FnHandler(|_: &PhaseContext| -> Result<()> {
                Err(NovaError::Hook("store offline".to_string()))
            })),
        );
        registry.register(
            LifecyclePhase::BeforeTask,
            "panicky",
            2,
            Arc::new(FnHandler(|_: &PhaseContext| -> Result<()> { panic!("boom") })),
        );
        registry.register(LifecyclePhase::BeforeTask, "ok", 3, recorder(&log, "ok"));

        let report = registry.execute_phase(&before_task()).await;
        assert_eq!(report.executed, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(*log.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_only_matching_phase_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(LifecyclePhase::AfterTask, "a", 1, recorder(&log, "after"));

        let report = registry.execute_phase(&before_task()).await;
        assert_eq!(report.executed, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unregister() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        let id = registry.register(LifecyclePhase::BeforeBuild, "a", 1, recorder(&log, "x"));
        registry.register(LifecyclePhase::Handoff, "a", 1, recorder(&log, "y"));
        registry.register(LifecyclePhase::Handoff, "b", 1, recorder(&log, "z"));
        assert_eq!(registry.len(), 3);

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert_eq!(registry.unregister_module("a"), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_hooks_for_phase_is_a_snapshot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.register(LifecyclePhase::BeforeBuild, "a", 1, recorder(&log, "x"));

        let snapshot = registry.get_hooks_for_phase(LifecyclePhase::BeforeBuild);
        registry.register(LifecyclePhase::BeforeBuild, "b", 0, recorder(&log, "y"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.get_hooks_for_phase(LifecyclePhase::BeforeBuild)[0].module, "b");
    }

    struct MemoryModule;

    impl HookModule for MemoryModule {
        fn name(&self) -> &str {
            "memory"
        }

        fn hooks(&self) -> Vec<HookSpec> {
            let noop = |_: &PhaseContext| -> Result<()> { Ok(()) };
            vec![
                HookSpec::new(LifecyclePhase::AfterTask, 50, FnHandler(noop)),
                HookSpec::new(LifecyclePhase::Handoff, 50, FnHandler(noop)),
            ]
        }
    }

    #[test]
    fn test_flag_store_disable_wins_over_config() {
        let mut config = NovaConfig::default();
        config.features.insert("memory".to_string(), true);
        let flags = StaticFlags::new().with("memory", false);

        let mut registry = HookRegistry::new();
        assert!(registry.register_module(&MemoryModule, &flags, &config).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_module_registers_when_enabled() {
        let config = NovaConfig::default();
        let mut registry = HookRegistry::new();
        let ids = registry.register_module(&MemoryModule, &StaticFlags::new(), &config);
        assert_eq!(ids.len(), 2);
        assert_eq!(registry.get_hooks_for_phase(LifecyclePhase::Handoff)[0].module, "memory");
    }

    #[test]
    fn test_phase_names_serialize() {
        assert_eq!(
            serde_json::to_string(&LifecyclePhase::TaskError).unwrap(),
            "\"onTaskError\""
        );
        assert_eq!(before_task().phase(), LifecyclePhase::BeforeTask);
    }
}

//! Handoff payloads between agents
//!
//! When control passes from one agent to the next, every registered
//! collector contributes a snapshot of its module's state to a named slot
//! of the payload. Collectors are fail-open: an error or panic leaves the
//! slot empty and the payload is still built.

use crate::hooks::{HandoffContext, PhaseContext};
use chrono::{DateTime, Utc};
use nova_core::fail_open::fail_open_sync;
use nova_core::{Agent, Result, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Named payload slot a collector fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandoffSlot {
    ModelRouting,
    Memory,
    Workflow,
    Collaboration,
    Observability,
}

impl HandoffSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelRouting => "modelRouting",
            Self::Memory => "memory",
            Self::Workflow => "workflow",
            Self::Collaboration => "collaboration",
            Self::Observability => "observability",
        }
    }
}

impl std::fmt::Display for HandoffSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments passed to every collector
#[derive(Debug, Clone, Copy)]
pub struct CollectorArgs<'a> {
    pub from: Agent,
    pub to: Agent,
    pub task_id: &'a str,
    pub build_id: &'a str,
}

/// Inputs for one payload
#[derive(Debug, Clone)]
pub struct HandoffParams {
    pub from: Agent,
    pub to: Agent,
    pub task_id: TaskId,
    pub build_id: String,
    pub output: Option<String>,
    pub duration_ms: Option<u64>,
    pub quality_score: Option<f32>,
    pub metadata: BTreeMap<String, Value>,
}

impl HandoffParams {
    pub fn new(from: Agent, to: Agent, task_id: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            from,
            to,
            task_id: task_id.into(),
            build_id: build_id.into(),
            output: None,
            duration_ms: None,
            quality_score: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach the finished task's outcome
    pub fn with_outcome(mut self, output: impl Into<String>, duration_ms: u64, quality_score: f32) -> Self {
        self.output = Some(output.into());
        self.duration_ms = Some(duration_ms);
        self.quality_score = Some(quality_score);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Immutable snapshot handed to the next agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffPayload {
    pub from_agent: Agent,
    pub to_agent: Agent,
    pub task_id: TaskId,
    pub build_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_routing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaboration: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<Value>,
}

impl HandoffPayload {
    fn base(params: &HandoffParams) -> Self {
        Self {
            from_agent: params.from,
            to_agent: params.to,
            task_id: params.task_id.clone(),
            build_id: params.build_id.clone(),
            timestamp: Utc::now(),
            output: params.output.clone(),
            duration_ms: params.duration_ms,
            quality_score: params.quality_score,
            metadata: params.metadata.clone(),
            model_routing: None,
            memory: None,
            workflow: None,
            collaboration: None,
            observability: None,
        }
    }

    pub fn slot(&self, slot: HandoffSlot) -> Option<&Value> {
        match slot {
            HandoffSlot::ModelRouting => self.model_routing.as_ref(),
            HandoffSlot::Memory => self.memory.as_ref(),
            HandoffSlot::Workflow => self.workflow.as_ref(),
            HandoffSlot::Collaboration => self.collaboration.as_ref(),
            HandoffSlot::Observability => self.observability.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: HandoffSlot) -> &mut Option<Value> {
        match slot {
            HandoffSlot::ModelRouting => &mut self.model_routing,
            HandoffSlot::Memory => &mut self.memory,
            HandoffSlot::Workflow => &mut self.workflow,
            HandoffSlot::Collaboration => &mut self.collaboration,
            HandoffSlot::Observability => &mut self.observability,
        }
    }
}

type CollectorFn = Box<dyn Fn(&CollectorArgs<'_>) -> Result<Option<Value>> + Send + Sync>;

struct Collector {
    module: String,
    slot: HandoffSlot,
    collect: CollectorFn,
}

/// Assembles handoff payloads from registered collectors
#[derive(Default)]
pub struct HandoffContextBuilder {
    collectors: Vec<Collector>,
}

impl HandoffContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a module with a payload slot
    ///
    /// Registering the same module again replaces its collector in place.
    pub fn register_collector<F>(&mut self, module: impl Into<String>, slot: HandoffSlot, collect: F)
    where
        F: Fn(&CollectorArgs<'_>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let collector = Collector {
            module: module.into(),
            slot,
            collect: Box::new(collect),
        };

        match self.collectors.iter_mut().find(|c| c.module == collector.module) {
            Some(existing) => *existing = collector,
            None => self.collectors.push(collector),
        }
    }

    pub fn unregister_collector(&mut self, module: &str) -> bool {
        let before = self.collectors.len();
        self.collectors.retain(|c| c.module != module);
        self.collectors.len() != before
    }

    /// Registered (module, slot) pairs in invocation order
    pub fn collectors(&self) -> Vec<(&str, HandoffSlot)> {
        self.collectors
            .iter()
            .map(|c| (c.module.as_str(), c.slot))
            .collect()
    }

    /// Build a payload, invoking every collector in registration order
    pub fn build_payload(&self, params: &HandoffParams) -> HandoffPayload {
        let mut payload = HandoffPayload::base(params);
        let args = CollectorArgs {
            from: params.from,
            to: params.to,
            task_id: &params.task_id,
            build_id: &params.build_id,
        };

        for collector in &self.collectors {
            let name = format!("{} handoff collector", collector.module);
            match fail_open_sync(&name, || (collector.collect)(&args)) {
                Some(Some(value)) => *payload.slot_mut(collector.slot) = Some(value),
                Some(None) => debug!("{} had nothing for {}", collector.module, collector.slot),
                None => {}
            }
        }

        payload
    }

    /// Build a payload wrapped for `onHandoff` dispatch
    pub fn build_lifecycle_context(&self, params: &HandoffParams) -> PhaseContext {
        PhaseContext::Handoff(HandoffContext {
            from: params.from,
            to: params.to,
            task_id: params.task_id.clone(),
            payload: self.build_payload(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::LifecyclePhase;
    use nova_core::NovaError;
    use serde_json::json;

    fn params() -> HandoffParams {
        HandoffParams::new(Agent::Pluto, Agent::Mars, "t-1", "build-1")
    }

    #[test]
    fn test_null_collector_omits_slot() {
        let mut builder = HandoffContextBuilder::new();
        builder.register_collector("router", HandoffSlot::ModelRouting, |_| Ok(None));
        builder.register_collector("memory", HandoffSlot::Memory, |args| {
            Ok(Some(json!({ "for": args.to.label() })))
        });

        let payload = builder.build_payload(&params());
        assert!(payload.model_routing.is_none());
        assert_eq!(payload.memory, Some(json!({ "for": "MARS" })));

        let wire = serde_json::to_value(&payload).unwrap();
        assert!(wire.get("modelRouting").is_none());
        assert!(wire.get("memory").is_some());
        assert_eq!(wire["fromAgent"], "PLUTO");
    }

    #[test]
    fn test_failing_collector_is_skipped() {
        let mut builder = HandoffContextBuilder::new();
        builder.register_collector("broken", HandoffSlot::Workflow, |_| {
            Err(NovaError::Collector("workflow store offline".to_string()))
        });
        builder.register_collector("panicky", HandoffSlot::Observability, |_| panic!("boom"));
        builder.register_collector("session", HandoffSlot::Collaboration, |_| {
            Ok(Some(json!("session-7")))
        });

        let payload = builder.build_payload(&params().with_outcome("done", 1200, 0.8));
        assert!(payload.workflow.is_none());
        assert!(payload.observability.is_none());
        assert_eq!(payload.slot(HandoffSlot::Collaboration), Some(&json!("session-7")));
        assert_eq!(payload.task_id, "t-1");
        assert_eq!(payload.duration_ms, Some(1200));
    }

    #[test]
    fn test_reregistering_replaces_collector() {
        let mut builder = HandoffContextBuilder::new();
        builder.register_collector("memory", HandoffSlot::Memory, |_| Ok(Some(json!(1))));
        builder.register_collector("tracing", HandoffSlot::Observability, |_| Ok(None));
        builder.register_collector("memory", HandoffSlot::Memory, |_| Ok(Some(json!(2))));

        assert_eq!(
            builder.collectors(),
            vec![("memory", HandoffSlot::Memory), ("tracing", HandoffSlot::Observability)]
        );
        assert_eq!(builder.build_payload(&params()).memory, Some(json!(2)));

        assert!(builder.unregister_collector("memory"));
        assert!(builder.build_payload(&params()).memory.is_none());
    }

    #[test]
    fn test_lifecycle_context() {
        let builder = HandoffContextBuilder::new();
        let context = builder.build_lifecycle_context(&params().with_metadata("phase", json!(2)));
        assert_eq!(context.phase(), LifecyclePhase::Handoff);
        let PhaseContext::Handoff(handoff) = context else {
            panic!("expected handoff context");
        };
        assert_eq!(handoff.from, Agent::Pluto);
        assert_eq!(handoff.payload.metadata["phase"], json!(2));
    }
}

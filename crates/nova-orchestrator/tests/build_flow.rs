//! End-to-end builds against scripted agents

use async_trait::async_trait;
use nova_core::{Agent, GateKind, NovaConfig, NovaError, Result, Task, TaskStatus};
use nova_orchestrator::{
    respond_to_pending, ApprovalOptions, ApprovalResult, BuildOrchestrator, FnHandler,
    HandoffContextBuilder, HandoffSlot, HookRegistry, LifecycleHandler, LifecyclePhase,
    MemoryTransport, PhaseContext, PlanApprovalCoordinator,
};
use nova_validation::{GateRunner, HardLimits, LlmClient};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Answers in the agent's expected structure, echoing the prompt
struct ScriptedLlm {
    broken: HashSet<Agent>,
    /// Emit only the first expected tag
    partial: bool,
    prompts: Mutex<Vec<(Agent, String)>>,
}

impl ScriptedLlm {
    fn new() -> Self {
        Self {
            broken: HashSet::new(),
            partial: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn broken_for(agent: Agent) -> Self {
        Self {
            broken: HashSet::from([agent]),
            ..Self::new()
        }
    }

    fn partial() -> Self {
        Self {
            partial: true,
            ..Self::new()
        }
    }

    fn prompts(&self) -> Vec<(Agent, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, user: &str, agent: Agent) -> Result<String> {
        self.prompts.lock().unwrap().push((agent, user.to_string()));
        if self.broken.contains(&agent) {
            return Err(NovaError::Llm(format!("{} is unavailable", agent)));
        }

        let body = format!("Completed work for the request below.\n{}", user);
        let tags = agent.profile().expected_tags;
        let tags = if self.partial { &tags[..tags.len().min(1)] } else { tags };
        if tags.is_empty() {
            return Ok(body);
        }
        Ok(tags
            .iter()
            .map(|tag| format!("<{}>\n{}\n</{}>", tag, body, tag))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

struct PhaseLog(Arc<Mutex<Vec<LifecyclePhase>>>);

#[async_trait]
impl LifecycleHandler for PhaseLog {
    async fn handle(&self, context: &PhaseContext) -> Result<()> {
        self.0.lock().unwrap().push(context.phase());
        Ok(())
    }
}

fn registry(log: &Arc<Mutex<Vec<LifecyclePhase>>>) -> HookRegistry {
    let mut registry = HookRegistry::new();
    for phase in LifecyclePhase::ALL {
        registry.register(phase, "recorder", 100, Arc::new(PhaseLog(log.clone())));
    }
    registry
}

fn config() -> NovaConfig {
    let mut config = NovaConfig::default();
    config.gates.min_response_length = 20;
    config
}

fn orchestrator(
    config: NovaConfig,
    log: &Arc<Mutex<Vec<LifecyclePhase>>>,
    llm: Arc<ScriptedLlm>,
) -> BuildOrchestrator {
    let gates = GateRunner::new(config.gates.clone(), HardLimits::disabled());
    BuildOrchestrator::new(config, registry(log), HandoffContextBuilder::new(), gates, llm)
}

#[tokio::test]
async fn test_schema_and_api_build_completes() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = Arc::new(ScriptedLlm::new());
    let mut orchestrator = orchestrator(config(), &log, llm.clone());

    let handoffs = Arc::new(Mutex::new(0usize));
    {
        let handoffs = handoffs.clone();
        orchestrator
            .handoff_mut()
            .register_collector("workflow", HandoffSlot::Workflow, move |args| {
                *handoffs.lock().unwrap() += 1;
                Ok(Some(serde_json::json!({ "next": args.to.label() })))
            });
    }

    let task = Task::new(
        "player-stats",
        "Player stats service",
        "Create the database schema for players and an api endpoint that returns player stats",
        Agent::Mars,
    );
    let summary = orchestrator
        .run_build("spec-1", "stats", vec![task])
        .await
        .unwrap();

    assert!(summary.succeeded());
    assert!(summary.total_tasks >= 6);
    assert_eq!(summary.completed, summary.total_tasks);
    assert!((summary.average_quality - 1.0).abs() < f32::EPSILON);

    let agents: HashSet<Agent> = summary.subtasks.iter().map(|s| s.agent).collect();
    for agent in [Agent::Pluto, Agent::Enceladus, Agent::Mars, Agent::Charon] {
        assert!(agents.contains(&agent), "missing {}", agent);
    }

    let phases = log.lock().unwrap().clone();
    assert_eq!(phases.first(), Some(&LifecyclePhase::BeforeBuild));
    assert_eq!(phases.last(), Some(&LifecyclePhase::BuildComplete));
    let before = phases.iter().filter(|p| **p == LifecyclePhase::BeforeTask).count();
    let after = phases.iter().filter(|p| **p == LifecyclePhase::AfterTask).count();
    assert_eq!(before, summary.total_tasks);
    assert_eq!(after, summary.total_tasks);

    let handoff_phases = phases.iter().filter(|p| **p == LifecyclePhase::Handoff).count();
    assert!(handoff_phases > 0);
    assert_eq!(*handoffs.lock().unwrap(), handoff_phases);

    // Every executed subtask saw exactly one attempt
    assert_eq!(llm.prompts().len(), summary.total_tasks);
}

#[tokio::test]
async fn test_failed_subtask_blocks_dependents() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = Arc::new(ScriptedLlm::broken_for(Agent::Mars));
    let orchestrator = orchestrator(config(), &log, llm.clone());

    let league = Task::new(
        "league",
        "Update league scoring",
        "Rework the scoring rules for the weekly league so that ties are broken by head to head \
         record first and then by total points scored across every round of the season",
        Agent::Mars,
    );
    let follow_up = Task::new("recap", "Write recap", "Summarize the new rules", Agent::Callisto)
        .with_dependencies(vec!["league".to_string()]);

    let summary = orchestrator
        .run_build("spec-2", "league", vec![league, follow_up])
        .await
        .unwrap();

    let status = |id: &str| {
        summary
            .subtasks
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.status)
            .unwrap()
    };
    assert_eq!(status("league-1"), TaskStatus::Completed);
    assert_eq!(status("league-2"), TaskStatus::Completed);
    assert_eq!(status("league-3"), TaskStatus::Failed);
    assert_eq!(status("league-4"), TaskStatus::Failed);
    assert_eq!(status("recap"), TaskStatus::Failed);

    let implement = summary.subtasks.iter().find(|s| s.id == "league-3").unwrap();
    assert_eq!(implement.attempts, 3);
    let validate = summary.subtasks.iter().find(|s| s.id == "league-4").unwrap();
    assert_eq!(validate.attempts, 0);
    assert!(validate.error.as_deref().unwrap().contains("league-3"));

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 3);

    let errors = log
        .lock()
        .unwrap()
        .iter()
        .filter(|p| **p == LifecyclePhase::TaskError)
        .count();
    assert_eq!(errors, 1);

    let mars_calls = llm.prompts().iter().filter(|(a, _)| *a == Agent::Mars).count();
    assert_eq!(mars_calls, 3);
}

#[tokio::test]
async fn test_partial_structure_lowers_average_quality() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let completes = Arc::new(Mutex::new(Vec::new()));
    let mut orchestrator = orchestrator(config(), &log, Arc::new(ScriptedLlm::partial()));
    {
        let completes = completes.clone();
        orchestrator.hooks_mut().register(
            LifecyclePhase::BuildComplete,
            "quality",
            50,
            Arc::new(FnHandler(move |context: &PhaseContext| -> Result<()> {
                if let PhaseContext::BuildComplete(done) = context {
                    completes.lock().unwrap().push(done.average_quality);
                }
                Ok(())
            })),
        );
    }

    let task = Task::new("rename", "Rename field", "Rename the display name field", Agent::Mars);
    let summary = orchestrator.run_build("spec-5", "rename", vec![task]).await.unwrap();

    // Six gates, the structural one scoring 0.5 on one of two tags
    let expected = 5.5 / 6.0;
    assert!(summary.succeeded());
    assert!((summary.average_quality - expected).abs() < 1e-5);
    assert!((summary.subtasks[0].quality_score.unwrap() - expected).abs() < 1e-5);
    assert_eq!(completes.lock().unwrap().len(), 1);
    assert!((completes.lock().unwrap()[0] - expected).abs() < 1e-5);
}

#[tokio::test]
async fn test_top_level_tasks_run_in_dependency_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = Arc::new(ScriptedLlm::new());
    let orchestrator = orchestrator(config(), &log, llm.clone());

    let tasks = vec![
        Task::new("b", "Fix typo two", "Fix the second typo", Agent::Callisto)
            .with_dependencies(vec!["a".to_string()]),
        Task::new("a", "Fix typo", "Fix the first typo", Agent::Callisto),
        Task::new("c", "Fix typo three", "Fix the third typo", Agent::Callisto)
            .with_dependencies(vec!["ghost".to_string()]),
        Task::new("d", "Fix loop one", "Fix one side", Agent::Callisto)
            .with_dependencies(vec!["e".to_string()]),
        Task::new("e", "Fix loop two", "Fix other side", Agent::Callisto)
            .with_dependencies(vec!["d".to_string()]),
    ];
    let summary = orchestrator.run_build("spec-6", "typos", tasks).await.unwrap();

    let titles: Vec<String> = llm
        .prompts()
        .iter()
        .map(|(_, prompt)| prompt.lines().next().unwrap_or_default().to_string())
        .collect();
    assert_eq!(titles, vec!["Fix typo", "Fix typo two"]);

    let report = |id: &str| summary.subtasks.iter().find(|s| s.id == id).unwrap().clone();
    assert_eq!(report("a").status, TaskStatus::Completed);
    assert_eq!(report("b").status, TaskStatus::Completed);

    let ghost = report("c");
    assert_eq!(ghost.status, TaskStatus::Failed);
    assert_eq!(ghost.attempts, 0);
    assert!(ghost.error.unwrap().contains("unknown task ghost"));

    for id in ["d", "e"] {
        let looped = report(id);
        assert_eq!(looped.status, TaskStatus::Failed);
        assert!(looped.error.unwrap().contains("cycle"));
    }
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 3);
}

/// Answers every pending approval with `result` until aborted
fn spawn_approver(
    transport: Arc<MemoryTransport>,
    result: ApprovalResult,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if transport.has_request() && !transport.has_response() {
                let _ = respond_to_pending(transport.as_ref(), &result).await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

fn approval_orchestrator(
    log: &Arc<Mutex<Vec<LifecyclePhase>>>,
    llm: Arc<ScriptedLlm>,
    transport: Arc<MemoryTransport>,
) -> BuildOrchestrator {
    let mut config = config();
    config.approval.enabled = true;
    config.approval.poll_interval_ms = 10;
    config.gates.sequence = vec![GateKind::ResponseValidation];

    let coordinator = PlanApprovalCoordinator::new(transport, &config.approval);
    orchestrator(config, log, llm)
        .with_approval(Arc::new(coordinator))
        .with_approval_options(ApprovalOptions::default().with_timeout(Duration::from_secs(5)))
}

#[tokio::test]
async fn test_rejected_plan_fails_without_execution() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = Arc::new(ScriptedLlm::new());
    let transport = Arc::new(MemoryTransport::new());
    let orchestrator = approval_orchestrator(&log, llm.clone(), transport.clone());
    let approver = spawn_approver(
        transport.clone(),
        ApprovalResult::Rejected {
            reason: "out of scope".to_string(),
        },
    );

    let task = Task::new("rename", "Rename field", "Rename the display name field", Agent::Mars);
    let summary = orchestrator.run_build("spec-3", "rename", vec![task]).await.unwrap();
    approver.abort();

    assert_eq!(summary.failed, 1);
    assert_eq!(
        summary.subtasks[0].error.as_deref(),
        Some("Plan rejected: out of scope")
    );
    assert!(llm.prompts().is_empty());
    assert!(!transport.has_request());
}

#[tokio::test]
async fn test_modified_plan_becomes_the_prompt() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = Arc::new(ScriptedLlm::new());
    let transport = Arc::new(MemoryTransport::new());
    let orchestrator = approval_orchestrator(&log, llm.clone(), transport.clone());
    let approver = spawn_approver(
        transport.clone(),
        ApprovalResult::Modified {
            plan: "Rename only the API-facing field".to_string(),
        },
    );

    let task = Task::new("rename", "Rename field", "Rename the display name field", Agent::Mars);
    let summary = orchestrator.run_build("spec-4", "rename", vec![task]).await.unwrap();
    approver.abort();

    assert!(summary.succeeded());
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].1, "Rename only the API-facing field");
}

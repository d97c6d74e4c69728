//! Build orchestrator
//!
//! Drives a build: decompose each task, run ready subtasks through the
//! LLM layer and the gate pipeline, and fire lifecycle hooks at every step.

use crate::approval::{ApprovalOptions, ApprovalResult, PlanApprovalCoordinator};
use crate::handoff::{HandoffContextBuilder, HandoffParams};
use crate::hooks::{
    BuildCompleteContext, BuildStartContext, HookRegistry, PhaseContext, TaskOutcome,
    TaskStartContext,
};
use chrono::Utc;
use nova_core::{Agent, NovaConfig, Result, Subtask, Task, TaskId, TaskStatus};
use nova_planning::{analyze_complexity, graph, should_decompose, DecomposedTask, TaskDecomposer};
use nova_validation::{all_gates_passed, gates_summary, quality_score, GateRunner, LlmClient};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Final state of one executed (or blocked) subtask
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskReport {
    pub id: TaskId,
    pub parent_id: TaskId,
    pub agent: Agent,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a build
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub build_id: String,
    pub spec_id: String,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean gate quality over completed subtasks (0.0 when none completed)
    pub average_quality: f32,
    pub subtasks: Vec<SubtaskReport>,
}

impl BuildSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Last executed subtask, for handoff detection
struct LastRun {
    agent: Agent,
    task_id: TaskId,
    output: Option<String>,
    duration_ms: u64,
    quality: Option<f32>,
}

#[derive(Default)]
struct BuildState {
    last: Option<LastRun>,
    reports: Vec<SubtaskReport>,
    failed_tasks: HashSet<TaskId>,
    completed_tasks: HashSet<TaskId>,
}

/// Outcome of running one subtask to completion or exhaustion
enum Execution {
    Completed { output: String, quality: f32 },
    Failed { error: String },
}

/// Runs builds end to end
pub struct BuildOrchestrator {
    config: NovaConfig,
    hooks: HookRegistry,
    handoff: HandoffContextBuilder,
    gates: GateRunner,
    llm: Arc<dyn LlmClient>,
    approval: Option<Arc<PlanApprovalCoordinator>>,
    approval_options: ApprovalOptions,
}

impl BuildOrchestrator {
    pub fn new(
        config: NovaConfig,
        hooks: HookRegistry,
        handoff: HandoffContextBuilder,
        gates: GateRunner,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            config,
            hooks,
            handoff,
            gates,
            llm,
            approval: None,
            approval_options: ApprovalOptions::default(),
        }
    }

    /// Route subtask plans through approval when `[approval] enabled` is set
    pub fn with_approval(mut self, coordinator: Arc<PlanApprovalCoordinator>) -> Self {
        self.approval = Some(coordinator);
        self
    }

    pub fn with_approval_options(mut self, options: ApprovalOptions) -> Self {
        self.approval_options = options;
        self
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn handoff_mut(&mut self) -> &mut HandoffContextBuilder {
        &mut self.handoff
    }

    /// Expand a task, or wrap it as a single subtask when it is small
    pub fn plan_task(&self, task: &Task) -> Result<DecomposedTask> {
        let plan = if should_decompose(&task.title, &task.description) {
            TaskDecomposer::decompose_task(&task.id, &task.title, &task.description, task.agent)
        } else {
            DecomposedTask::single(task, analyze_complexity(&task.title, &task.description))
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Run every task of a build in order
    #[instrument(skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn run_build(&self, spec_id: &str, name: &str, tasks: Vec<Task>) -> Result<BuildSummary> {
        let build_id = format!("build-{}", Uuid::new_v4());
        info!("Starting build {} ({})", build_id, name);

        self.hooks
            .execute_phase(&PhaseContext::BeforeBuild(BuildStartContext {
                build_id: build_id.clone(),
                spec_id: spec_id.to_string(),
                name: name.to_string(),
                started_at: Utc::now(),
                options: Default::default(),
            }))
            .await;

        let mut state = BuildState::default();
        let (ordered, cyclic) = schedule(&tasks);
        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        for task in ordered {
            let mut plan = self.plan_task(task)?;
            info!(
                "Task {} planned as {} subtask(s)",
                task.id,
                plan.subtasks.len()
            );

            let blocker = task.dependencies.iter().find_map(|dep| {
                if !known.contains(dep.as_str()) {
                    Some(format!("depends on unknown task {}", dep))
                } else if state.failed_tasks.contains(dep) {
                    Some(format!("blocked by failed task {}", dep))
                } else if !state.completed_tasks.contains(dep) {
                    Some(format!("dependency {} never completed", dep))
                } else {
                    None
                }
            });

            let qualities = match blocker {
                Some(reason) => {
                    warn!("Task {} not run: {}", task.id, reason);
                    fail_plan(&mut plan, &reason);
                    HashMap::new()
                }
                None => self.run_plan(&mut plan, task, &build_id, &mut state).await?,
            };

            if plan.has_failures() {
                state.failed_tasks.insert(task.id.clone());
            } else {
                state.completed_tasks.insert(task.id.clone());
            }
            state.reports.extend(
                plan.subtasks
                    .iter()
                    .map(|s| report(s, qualities.get(&s.id).copied())),
            );
        }

        for task in cyclic {
            warn!("Task {} sits on a dependency cycle, not run", task.id);
            let mut plan = self.plan_task(task)?;
            fail_plan(&mut plan, "dependency cycle between tasks");
            state.failed_tasks.insert(task.id.clone());
            state.reports.extend(plan.subtasks.iter().map(|s| report(s, None)));
        }

        let summary = summarize(build_id, spec_id, state.reports);
        info!(
            "Build {} finished: {}/{} completed, {} failed",
            summary.build_id, summary.completed, summary.total_tasks, summary.failed
        );

        self.hooks
            .execute_phase(&PhaseContext::BuildComplete(BuildCompleteContext {
                build_id: summary.build_id.clone(),
                spec_id: summary.spec_id.clone(),
                total_tasks: summary.total_tasks,
                completed: summary.completed,
                failed: summary.failed,
                average_quality: summary.average_quality,
            }))
            .await;

        Ok(summary)
    }

    async fn run_plan(
        &self,
        plan: &mut DecomposedTask,
        parent: &Task,
        build_id: &str,
        state: &mut BuildState,
    ) -> Result<HashMap<TaskId, f32>> {
        let mut qualities = HashMap::new();

        loop {
            let ready: Vec<TaskId> = plan.ready_subtasks().iter().map(|s| s.id.clone()).collect();
            if ready.is_empty() {
                break;
            }

            for id in ready {
                plan.mark_status(&id, TaskStatus::InProgress)?;
                let Some(subtask) = plan.subtask(&id).cloned() else {
                    continue;
                };

                let (execution, attempts, duration_ms) =
                    self.run_subtask(&subtask, parent, build_id, state).await;

                let Some(slot) = plan.subtask_mut(&id) else {
                    continue;
                };
                slot.attempts = attempts;

                match execution {
                    Execution::Completed { output, quality } => {
                        slot.status = TaskStatus::Completed;
                        slot.output = Some(output.clone());
                        qualities.insert(id.clone(), quality);
                        state.last = Some(LastRun {
                            agent: subtask.agent,
                            task_id: id.clone(),
                            output: Some(output),
                            duration_ms,
                            quality: Some(quality),
                        });
                    }
                    Execution::Failed { error } => {
                        slot.status = TaskStatus::Failed;
                        slot.error = Some(error);
                        state.last = Some(LastRun {
                            agent: subtask.agent,
                            task_id: id.clone(),
                            output: None,
                            duration_ms,
                            quality: None,
                        });

                        let blocked = plan.fail_dependents(&id);
                        if !blocked.is_empty() {
                            warn!("Subtask {} failed, blocking {}", id, blocked.join(", "));
                        }
                    }
                }
            }
        }

        // Anything still pending sits behind a dependency that never completed
        for subtask in &mut plan.subtasks {
            if !matches!(subtask.status, TaskStatus::Completed | TaskStatus::Failed) {
                subtask.status = TaskStatus::Failed;
                subtask.error = Some("dependencies never completed".to_string());
            }
        }

        Ok(qualities)
    }

    async fn run_subtask(
        &self,
        subtask: &Subtask,
        parent: &Task,
        build_id: &str,
        state: &BuildState,
    ) -> (Execution, u32, u64) {
        if let Some(last) = state.last.as_ref().filter(|l| l.agent != subtask.agent) {
            let mut params = HandoffParams::new(last.agent, subtask.agent, &last.task_id, build_id)
                .with_metadata("nextTaskId", serde_json::json!(subtask.id));
            params.output = last.output.clone();
            params.duration_ms = Some(last.duration_ms);
            params.quality_score = last.quality;
            self.hooks
                .execute_phase(&self.handoff.build_lifecycle_context(&params))
                .await;
        }

        self.hooks
            .execute_phase(&PhaseContext::BeforeTask(TaskStartContext {
                task_id: subtask.id.clone(),
                title: subtask.title.clone(),
                agent: subtask.agent,
                dependencies: subtask.dependencies.clone(),
            }))
            .await;

        let started = Instant::now();
        let mut task = subtask.to_task();
        task.context = parent.context.clone();

        let (execution, attempts) = match self.approved_prompt(&task).await {
            Ok(prompt) => self.execute_with_retries(&task, prompt).await,
            Err(error) => (Execution::Failed { error }, subtask.attempts),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let context = match &execution {
            Execution::Completed { output, quality } => PhaseContext::AfterTask(TaskOutcome {
                task_id: subtask.id.clone(),
                agent: subtask.agent,
                success: true,
                output: Some(output.clone()),
                error: None,
                duration_ms,
                quality_score: Some(*quality),
            }),
            Execution::Failed { error } => PhaseContext::TaskError(TaskOutcome {
                task_id: subtask.id.clone(),
                agent: subtask.agent,
                success: false,
                output: None,
                error: Some(error.clone()),
                duration_ms,
                quality_score: None,
            }),
        };
        self.hooks.execute_phase(&context).await;

        (execution, attempts, duration_ms)
    }

    /// The prompt to execute, after approval when it is enabled
    ///
    /// `Err` carries the reason the subtask must fail instead.
    async fn approved_prompt(&self, task: &Task) -> std::result::Result<String, String> {
        let prompt = format!("{}\n\n{}", task.title, task.description);

        let Some(coordinator) = self.approval.as_ref().filter(|_| self.config.approval.enabled) else {
            return Ok(prompt);
        };

        match coordinator
            .request_approval(&prompt, task, &self.approval_options)
            .await
        {
            Ok(ApprovalResult::Approved) => Ok(prompt),
            Ok(ApprovalResult::Modified { plan }) => {
                info!("Plan for {} modified by approver", task.id);
                Ok(plan)
            }
            Ok(ApprovalResult::Rejected { reason }) => Err(format!("Plan rejected: {}", reason)),
            Err(e) if e.is_cancellation() => Err("Approval cancelled".to_string()),
            Err(e) => Err(format!("Approval failed: {}", e)),
        }
    }

    async fn execute_with_retries(&self, task: &Task, prompt: String) -> (Execution, u32) {
        let max_attempts = self.config.build.max_retries + 1;
        let system = system_prompt(task.agent);
        let mut attempts = task.attempts;
        let mut user_prompt = prompt.clone();
        let mut last_error = String::from("not attempted");

        for attempt in 1..=max_attempts {
            attempts += 1;
            debug!("Executing {} (attempt {}/{})", task.id, attempt, max_attempts);

            let response = match self.llm.complete(&system, &user_prompt, task.agent).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Agent {} call failed for {}: {}", task.agent, task.id, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            let results = self.gates.run_gates(task, &response).await;
            if all_gates_passed(&results) {
                return (
                    Execution::Completed {
                        output: response,
                        quality: quality_score(&results),
                    },
                    attempts,
                );
            }

            let summary = gates_summary(&results);
            let failures: Vec<String> = results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| format!("- {}: {}", r.gate, r.message))
                .collect();
            info!("Gates failed for {}: {}", task.id, summary);

            last_error = format!("{}\n{}", summary, failures.join("\n"));
            user_prompt = format!(
                "{}\n\nYour previous response failed validation:\n{}\nAddress every failure.",
                prompt,
                failures.join("\n")
            );
        }

        (Execution::Failed { error: last_error }, attempts)
    }
}

fn system_prompt(agent: Agent) -> String {
    let tags = agent.profile().expected_tags;
    if tags.is_empty() {
        format!("You are {}. Complete the task you are given.", agent)
    } else {
        let sections: Vec<String> = tags.iter().map(|t| format!("<{}>", t)).collect();
        format!(
            "You are {}. Complete the task you are given and structure the answer in {} sections.",
            agent,
            sections.join(", ")
        )
    }
}

/// Tasks in dependency order, plus the tasks caught on a cycle
///
/// Order within a wave follows the input. Dependencies on unknown ids do not
/// hold a task back here; the build loop fails those tasks itself.
fn schedule(tasks: &[Task]) -> (Vec<&Task>, Vec<&Task>) {
    let nodes: Vec<(&str, &[TaskId])> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
        .collect();
    let waves = graph::dependency_waves(&nodes);

    let mut ordered = Vec::with_capacity(tasks.len());
    for id in waves.iter().flatten() {
        if let Some(task) = tasks.iter().find(|t| &t.id == id) {
            ordered.push(task);
        }
    }

    let placed: HashSet<&str> = waves.iter().flatten().map(String::as_str).collect();
    let cyclic = tasks
        .iter()
        .filter(|t| !placed.contains(t.id.as_str()))
        .collect();
    (ordered, cyclic)
}

fn fail_plan(plan: &mut DecomposedTask, reason: &str) {
    for subtask in &mut plan.subtasks {
        subtask.status = TaskStatus::Failed;
        subtask.error = Some(reason.to_string());
    }
}

fn report(subtask: &Subtask, quality: Option<f32>) -> SubtaskReport {
    SubtaskReport {
        id: subtask.id.clone(),
        parent_id: subtask.parent_id.clone(),
        agent: subtask.agent,
        status: subtask.status,
        attempts: subtask.attempts,
        quality_score: quality,
        error: subtask.error.clone(),
    }
}

fn summarize(build_id: String, spec_id: &str, subtasks: Vec<SubtaskReport>) -> BuildSummary {
    let completed = subtasks
        .iter()
        .filter(|s| s.status == TaskStatus::Completed)
        .count();
    let qualities: Vec<f32> = subtasks.iter().filter_map(|s| s.quality_score).collect();
    let average_quality = if qualities.is_empty() {
        0.0
    } else {
        qualities.iter().sum::<f32>() / qualities.len() as f32
    };

    BuildSummary {
        build_id,
        spec_id: spec_id.to_string(),
        total_tasks: subtasks.len(),
        completed,
        failed: subtasks.len() - completed,
        average_quality,
        subtasks,
    }
}

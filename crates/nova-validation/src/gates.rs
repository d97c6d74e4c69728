//! Quality gate pipeline
//!
//! A run first applies the agent's hard limits, then the configured gate
//! sequence. A severe hard-limit violation ends the run on the spot; within
//! the sequence the first failing gate ends the run and later gates never
//! execute.

use crate::hard_limits::{HardLimits, Severity};
use crate::llm::LlmClient;
use crate::sandbox::{extract_code_blocks, CodeBlock, Sandbox};
use nova_core::{Agent, GateKind, GatesConfig, NovaError, Result, Task};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Phrases that open an error message or a refusal instead of real work
const ERROR_OPENINGS: &[&str] = &[
    "error:",
    "i cannot",
    "i can't",
    "i'm sorry",
    "i am sorry",
    "i am unable",
    "i'm unable",
    "as an ai",
];

/// Words too common to say anything about a response
const STOPWORDS: &[&str] = &[
    "with", "from", "that", "this", "into", "for", "and", "the", "when", "then", "them", "their",
    "have", "should", "will", "make",
];

/// Outcome of one gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub message: String,
    /// Graded score in [0, 1] for gates that measure more than pass/fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl GateResult {
    pub fn pass(gate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: true,
            message: message.into(),
            score: None,
        }
    }

    pub fn fail(gate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            gate: gate.into(),
            passed: false,
            message: message.into(),
            score: None,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score.clamp(0.0, 1.0));
        self
    }

    /// Graded score, or 1.0/0.0 from the verdict
    pub fn effective_score(&self) -> f32 {
        match self.score {
            Some(score) => score,
            None if self.passed => 1.0,
            None => 0.0,
        }
    }
}

/// Aggregate pass: every executed gate passed
pub fn all_gates_passed(results: &[GateResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Mean score of the executed gates (1.0 when nothing ran)
///
/// Graded gates contribute their score, the rest 1.0 on pass and 0.0 on fail.
pub fn quality_score(results: &[GateResult]) -> f32 {
    if results.is_empty() {
        return 1.0;
    }
    results.iter().map(GateResult::effective_score).sum::<f32>() / results.len() as f32
}

/// Counts of a gate run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatesSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub failed_gates: Vec<String>,
}

pub fn gates_summary(results: &[GateResult]) -> GatesSummary {
    let failed_gates: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.gate.clone())
        .collect();

    GatesSummary {
        total: results.len(),
        passed: results.len() - failed_gates.len(),
        failed: failed_gates.len(),
        failed_gates,
    }
}

impl std::fmt::Display for GatesSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} gates passed", self.passed, self.total)?;
        if !self.failed_gates.is_empty() {
            write!(f, " (failed: {})", self.failed_gates.join(", "))?;
        }
        Ok(())
    }
}

/// Runs hard limits and the gate pipeline over task responses
pub struct GateRunner {
    config: GatesConfig,
    hard_limits: HardLimits,
    llm: Option<Arc<dyn LlmClient>>,
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl GateRunner {
    pub fn new(config: GatesConfig, hard_limits: HardLimits) -> Self {
        Self {
            config,
            hard_limits,
            llm: None,
            sandbox: None,
        }
    }

    /// Use an LLM for semantic validation (keyword fallback otherwise)
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Use a sandbox for type-check and test gates (skipped otherwise)
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn config(&self) -> &GatesConfig {
        &self.config
    }

    pub fn hard_limits(&self) -> &HardLimits {
        &self.hard_limits
    }

    /// Validate a response for a task
    ///
    /// Returns the results of every gate that actually executed, in order.
    #[instrument(skip(self, task, response), fields(task_id = %task.id, agent = %task.agent))]
    pub async fn run_gates(&self, task: &Task, response: &str) -> Vec<GateResult> {
        let mut results = Vec::new();

        for limit in self.hard_limits.for_agent(task.agent) {
            let Some(violation) = limit.evaluate(response) else {
                continue;
            };
            let result = GateResult::fail(format!("hard-limit:{}", violation.limit), violation.message);
            if violation.severity == Severity::Severe {
                warn!("Severe hard limit {} violated, aborting gates", violation.limit);
                results.push(result);
                return results;
            }
            warn!("Hard limit {} violated", violation.limit);
            results.push(result);
        }

        if !self.config.enabled {
            debug!("Gates disabled, skipping pipeline");
            return results;
        }

        for kind in &self.config.sequence {
            let result = self.run_gate(*kind, task, response).await;
            let passed = result.passed;
            debug!("Gate {} -> {}: {}", kind, passed, result.message);
            results.push(result);
            if !passed {
                info!("Gate {} failed, skipping remaining gates", kind);
                break;
            }
        }

        results
    }

    /// Run a single gate
    pub async fn run_gate(&self, kind: GateKind, task: &Task, response: &str) -> GateResult {
        match kind {
            GateKind::ResponseValidation => self.response_validation(response),
            GateKind::StructuralTags => self.structural_tags(task.agent, response),
            GateKind::Schema => schema_validation(task.agent, response),
            GateKind::Typecheck | GateKind::Tests => self.sandbox_gate(kind, response).await,
            GateKind::Semantic => self.semantic_validation(task, response).await,
        }
    }

    fn response_validation(&self, response: &str) -> GateResult {
        let gate = GateKind::ResponseValidation.name();
        let trimmed = response.trim();

        if trimmed.is_empty() {
            return GateResult::fail(gate, "Response is empty");
        }
        let length = trimmed.chars().count();
        if length < self.config.min_response_length {
            return GateResult::fail(
                gate,
                format!(
                    "Response too short ({} < {} chars)",
                    length, self.config.min_response_length
                ),
            );
        }
        let opening = trimmed.to_lowercase();
        if let Some(phrase) = ERROR_OPENINGS.iter().find(|p| opening.starts_with(*p)) {
            return GateResult::fail(
                gate,
                format!("Response looks like an error or refusal (starts with {:?})", phrase),
            );
        }

        GateResult::pass(gate, format!("Response valid ({} chars)", length))
    }

    fn structural_tags(&self, agent: Agent, response: &str) -> GateResult {
        let gate = GateKind::StructuralTags.name();
        let expected = agent.profile().expected_tags;
        if expected.is_empty() {
            return GateResult::pass(gate, "No structural tags expected (score 1.00)").with_score(1.0);
        }

        let found: Vec<&str> = expected
            .iter()
            .copied()
            .filter(|tag| extract_tag(response, tag).is_some())
            .collect();
        let score = found.len() as f32 / expected.len() as f32;
        let missing: Vec<&str> = expected
            .iter()
            .copied()
            .filter(|tag| !found.contains(tag))
            .collect();

        if score >= self.config.structural_pass_threshold {
            let note = if missing.is_empty() {
                String::new()
            } else {
                format!(", missing: {}", missing.join(", "))
            };
            GateResult::pass(gate, format!("Structure score {:.2}{}", score, note)).with_score(score)
        } else {
            GateResult::fail(
                gate,
                format!(
                    "Structure score {:.2} below {:.2}, missing: {}",
                    score,
                    self.config.structural_pass_threshold,
                    missing.join(", ")
                ),
            )
            .with_score(score)
        }
    }

    async fn sandbox_gate(&self, kind: GateKind, response: &str) -> GateResult {
        let gate = kind.name();
        let Some(sandbox) = self.sandbox.as_ref() else {
            return GateResult::pass(gate, "Skipped: no sandbox configured");
        };

        let blocks: Vec<CodeBlock> = extract_code_blocks(response)
            .into_iter()
            .filter(CodeBlock::is_source)
            .collect();
        if blocks.is_empty() {
            return GateResult::pass(gate, "Skipped: no code blocks");
        }

        let outcome = match kind {
            GateKind::Typecheck => sandbox.type_check(&blocks).await,
            _ => sandbox.run_tests(&blocks).await,
        };

        match outcome {
            Ok(report) if report.success => {
                GateResult::pass(gate, format!("{} code block(s) passed", blocks.len()))
            }
            Ok(report) => GateResult::fail(gate, report.diagnostics),
            Err(NovaError::SandboxUnavailable(reason)) => {
                warn!("Sandbox unavailable for {}: {}", gate, reason);
                GateResult::pass(gate, format!("Skipped: sandbox unavailable ({})", reason))
            }
            Err(e) => GateResult::fail(gate, format!("Sandbox error: {}", e)),
        }
    }

    async fn semantic_validation(&self, task: &Task, response: &str) -> GateResult {
        let gate = GateKind::Semantic.name();

        let Some(llm) = self.llm.as_ref() else {
            return keyword_fallback(task, response);
        };

        let system = format!(
            "You are {}, the validation agent. Decide whether the response fulfils the task. \
             Reply with PASS, or FAIL: <reason>.",
            Agent::Mercury
        );
        let user = format!(
            "Task: {}\n{}\n\nAgent: {}\n\nResponse:\n{}",
            task.title, task.description, task.agent, response
        );

        match llm.complete(&system, &user, Agent::Mercury).await {
            Ok(verdict) => {
                let verdict = verdict.trim();
                let upper = verdict.to_uppercase();
                if upper.starts_with("FAIL") {
                    let reason = verdict.get(4..).unwrap_or("").trim_start_matches([':', ' ', '-']).trim();
                    GateResult::fail(gate, format!("Semantic check failed: {}", reason))
                } else if upper.contains("PASS") {
                    GateResult::pass(gate, "Semantic check passed")
                } else {
                    GateResult::fail(gate, format!("Unrecognised verdict: {}", verdict))
                }
            }
            Err(e) => {
                warn!("Semantic validation call failed, using keyword fallback: {}", e);
                keyword_fallback(task, response)
            }
        }
    }
}

/// Content between `<tag>` and `</tag>`, if both are present in order
pub fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

fn schema_validation(agent: Agent, response: &str) -> GateResult {
    let gate = GateKind::Schema.name();
    let Some(block) = extract_code_blocks(response)
        .into_iter()
        .find(|b| b.language == "json")
    else {
        return GateResult::pass(gate, "No structured output to validate");
    };

    let value: serde_json::Value = match serde_json::from_str(&block.code) {
        Ok(value) => value,
        Err(e) => return GateResult::fail(gate, format!("Structured output is not valid JSON: {}", e)),
    };

    let required = agent.profile().schema_fields;
    if required.is_empty() {
        return GateResult::pass(gate, "Structured output parsed");
    }

    let Some(object) = value.as_object() else {
        return GateResult::fail(gate, "Structured output must be a JSON object");
    };
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();

    if missing.is_empty() {
        GateResult::pass(gate, format!("Structured output matches {} schema", agent))
    } else {
        GateResult::fail(
            gate,
            format!("Structured output missing fields: {}", missing.join(", ")),
        )
    }
}

/// Deterministic stand-in for the LLM verdict
fn keyword_fallback(task: &Task, response: &str) -> GateResult {
    let gate = GateKind::Semantic.name();
    let lower = response.to_lowercase();

    let title_words: BTreeSet<String> = task
        .title
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 4 && !STOPWORDS.contains(&w.as_str()))
        .collect();

    if title_words.is_empty() {
        let keywords = task.agent.profile().keywords;
        if keywords.is_empty() || keywords.iter().any(|k| lower.contains(k)) {
            return GateResult::pass(gate, "Keyword fallback: agent domain terms present");
        }
        return GateResult::fail(gate, "Keyword fallback: no agent domain terms in response");
    }

    let matched = title_words.iter().filter(|w| lower.contains(w.as_str())).count();
    let coverage = matched as f32 / title_words.len() as f32;
    if coverage >= 0.5 {
        GateResult::pass(
            gate,
            format!("Keyword fallback: {}/{} task terms present", matched, title_words.len()),
        )
    } else {
        GateResult::fail(
            gate,
            format!("Keyword fallback: only {}/{} task terms present", matched, title_words.len()),
        )
    }
}

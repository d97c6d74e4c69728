//! Agent-scoped hard limits
//!
//! Hard limits run before every other gate. Each limit is one of:
//! - a forbidden pattern (violated when the response matches)
//! - a required pattern (violated when the response does not match)
//! - a named custom check
//!
//! The limits document maps agent labels to ordered limit lists. A missing
//! document disables hard-limit checking.
//!
//! Patterns written as a single anchored lookahead (`^(?!...)` or
//! `^(?=...)`) are rewritten into the equivalent forbidden or required
//! rule, since the regex engine has no look-around. Any other look-around
//! is skipped with a warning.

use nova_core::{Agent, NovaError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// How a violation affects the gate run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the whole run
    Severe,
    /// Recorded, run continues
    Normal,
}

impl Severity {
    fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("severe") {
            Self::Severe
        } else {
            Self::Normal
        }
    }

    /// Prefix placed in front of violation messages
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Severe => "[SEVERE]",
            Self::Normal => "[WARNING]",
        }
    }
}

/// Named checks that are too involved for a single pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomCheck {
    /// All five UI states (loading, empty, error, partial, populated) are handled
    UiStates,
    /// No truncating/rounding helpers in balance or chip arithmetic
    ChipMath,
}

const UI_STATES: [&str; 5] = ["loading", "empty", "error", "partial", "populated"];

impl std::str::FromStr for CustomCheck {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "ui-states" | "five-ui-states" => Ok(Self::UiStates),
            "chip-math" | "balance-math" => Ok(Self::ChipMath),
            _ => Err(format!("Unknown custom check: {}", s)),
        }
    }
}

impl CustomCheck {
    /// Returns a description of the problem when the response violates the check
    fn violation(&self, response: &str) -> Option<String> {
        match self {
            Self::UiStates => {
                let lower = response.to_lowercase();
                let missing: Vec<&str> = UI_STATES
                    .iter()
                    .copied()
                    .filter(|state| !lower.contains(state))
                    .collect();
                if missing.is_empty() {
                    None
                } else {
                    Some(format!(
                        "{}/5 UI states handled, missing: {}",
                        UI_STATES.len() - missing.len(),
                        missing.join(", ")
                    ))
                }
            }
            Self::ChipMath => {
                static ROUNDING: OnceLock<Option<Regex>> = OnceLock::new();
                let rounding = ROUNDING
                    .get_or_init(|| {
                        Regex::new(
                            r"Math\.(floor|round|ceil|trunc)\s*\(|parseInt\s*\(|\bas\s+[iu](8|16|32|64|128|size)\b",
                        )
                        .ok()
                    })
                    .as_ref()?;

                response
                    .lines()
                    .enumerate()
                    .find(|(_, line)| {
                        let lower = line.to_lowercase();
                        (lower.contains("balance") || lower.contains("chip"))
                            && rounding.is_match(line)
                    })
                    .map(|(idx, line)| {
                        format!("unsafe rounding on line {}: {}", idx + 1, line.trim())
                    })
            }
        }
    }
}

/// What a hard limit checks
#[derive(Debug, Clone)]
pub enum LimitRule {
    Forbidden(Regex),
    Required(Regex),
    Check(CustomCheck),
}

/// A single agent-scoped hard limit
#[derive(Debug, Clone)]
pub struct HardLimit {
    pub name: String,
    pub rule: LimitRule,
    pub severity: Severity,
    pub message: String,
}

/// A limit the response failed
#[derive(Debug, Clone)]
pub struct HardLimitViolation {
    pub limit: String,
    pub severity: Severity,
    pub message: String,
}

impl HardLimit {
    /// Check the response; `None` when it satisfies the limit
    pub fn evaluate(&self, response: &str) -> Option<HardLimitViolation> {
        let detail = match &self.rule {
            LimitRule::Forbidden(re) => re
                .find(response)
                .map(|m| format!("matched forbidden text {:?}", m.as_str())),
            LimitRule::Required(re) => {
                if re.is_match(response) {
                    None
                } else {
                    Some("required content is missing".to_string())
                }
            }
            LimitRule::Check(check) => check.violation(response),
        }?;

        Some(HardLimitViolation {
            limit: self.name.clone(),
            severity: self.severity,
            message: format!("{} {} ({})", self.severity.prefix(), self.message, detail),
        })
    }
}

/// Limit entry as written in the limits document
#[derive(Debug, Clone, Deserialize)]
struct LimitSpec {
    name: String,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    required: Option<String>,
    #[serde(default)]
    check: Option<String>,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    message: String,
}

/// Split `^(?!X)` / `^(?=X)` into (negative, X)
///
/// Only a lookahead that spans the whole pattern qualifies.
fn anchored_lookahead(pattern: &str) -> Option<(bool, &str)> {
    let negative = if pattern.starts_with("^(?!") {
        true
    } else if pattern.starts_with("^(?=") {
        false
    } else {
        return None;
    };

    let body = &pattern[4..];
    let mut depth = 1usize;
    let mut in_class = false;
    let mut chars = body.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => {
                depth -= 1;
                if depth == 0 {
                    return (idx + 1 == body.len()).then(|| (negative, &body[..idx]));
                }
            }
            _ => {}
        }
    }
    None
}

impl LimitSpec {
    fn into_limit(self, agent: &str) -> Option<HardLimit> {
        // `forbidden` is the rule the key asks for; a negative lookahead flips it
        let compile = |pattern: &str, forbidden: bool| {
            let (forbidden, source) = match anchored_lookahead(pattern) {
                Some((negative, inner)) => {
                    debug!("Rewriting lookahead in hard limit {}/{}", agent, self.name);
                    (forbidden != negative, format!("^(?:{})", inner))
                }
                None => (forbidden, pattern.to_string()),
            };
            match Regex::new(&source) {
                Ok(re) if forbidden => Some(LimitRule::Forbidden(re)),
                Ok(re) => Some(LimitRule::Required(re)),
                Err(e) => {
                    warn!(
                        "Skipping hard limit {}/{}: invalid pattern ({})",
                        agent, self.name, e
                    );
                    None
                }
            }
        };

        let rule = if let Some(check) = &self.check {
            match check.parse::<CustomCheck>() {
                Ok(check) => LimitRule::Check(check),
                Err(e) => {
                    warn!("Skipping hard limit {}/{}: {}", agent, self.name, e);
                    return None;
                }
            }
        } else if let Some(pattern) = &self.pattern {
            compile(pattern, true)?
        } else if let Some(pattern) = &self.required {
            compile(pattern, false)?
        } else {
            warn!(
                "Skipping hard limit {}/{}: no pattern, required or check",
                agent, self.name
            );
            return None;
        };

        let message = if self.message.is_empty() {
            self.name.clone()
        } else {
            self.message
        };

        Some(HardLimit {
            name: self.name,
            rule,
            severity: Severity::from_label(&self.severity),
            message,
        })
    }
}

/// Hard limits for every agent
#[derive(Debug, Clone, Default)]
pub struct HardLimits {
    limits: HashMap<Agent, Vec<HardLimit>>,
}

impl HardLimits {
    /// No limits (hard-limit checking disabled)
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Load the limits document, treating a missing file as "disabled"
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No hard limits at {}, hard limits disabled", path.display());
            return Ok(Self::disabled());
        }

        let content = std::fs::read_to_string(path)?;
        let limits = Self::from_json(&content)?;
        info!(
            "Loaded {} hard limits from {}",
            limits.len(),
            path.display()
        );
        Ok(limits)
    }

    /// Parse a limits document
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<LimitSpec>> = serde_json::from_str(content)
            .map_err(|e| NovaError::Config(format!("Invalid hard limits document: {}", e)))?;

        let mut limits = HashMap::new();
        for (label, specs) in raw {
            let agent = match label.parse::<Agent>() {
                Ok(agent) => agent,
                Err(e) => {
                    warn!("Ignoring hard limits for {}: {}", label, e);
                    continue;
                }
            };
            let agent_limits: Vec<HardLimit> = specs
                .into_iter()
                .filter_map(|spec| spec.into_limit(&label))
                .collect();
            limits.insert(agent, agent_limits);
        }

        Ok(Self { limits })
    }

    /// Add a limit for an agent
    pub fn add(&mut self, agent: Agent, limit: HardLimit) {
        self.limits.entry(agent).or_default().push(limit);
    }

    /// Limits for an agent, in document order
    pub fn for_agent(&self, agent: Agent) -> &[HardLimit] {
        self.limits.get(&agent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of limits
    pub fn len(&self) -> usize {
        self.limits.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

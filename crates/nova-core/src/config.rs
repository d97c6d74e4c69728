//! Configuration management for Nova
//!
//! This module provides configuration structures for repository-level Nova settings:
//! the approval file protocol, the gate pipeline, build retries and module features.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{NovaError, Result};

/// Environment variable carrying the autonomy level (1-5)
pub const AUTONOMY_ENV: &str = "NOVA_AUTONOMY_LEVEL";

/// Autonomy level used when nothing else supplies one
pub const DEFAULT_AUTONOMY_LEVEL: u8 = 3;

/// Repository-level Nova configuration
///
/// Loaded from `.nova/config.toml` in the repo root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NovaConfig {
    /// Plan approval protocol
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Gate pipeline configuration
    #[serde(default)]
    pub gates: GatesConfig,

    /// Build execution defaults
    #[serde(default)]
    pub build: BuildConfig,

    /// Module enablement (module name -> enabled)
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

/// Plan approval protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Route subtask plans through human approval
    #[serde(default)]
    pub enabled: bool,

    /// Where the pending approval record is written
    #[serde(default = "default_request_path")]
    pub request_path: PathBuf,

    /// Where the external actor writes its response
    #[serde(default = "default_response_path")]
    pub response_path: PathBuf,

    /// Response poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Use file-change notification to shorten wait latency
    #[serde(default = "default_true")]
    pub watch: bool,
}

/// Gate pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    /// Run the configured gate sequence after hard limits
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Gates to run, in order
    #[serde(default = "default_gate_sequence")]
    pub sequence: Vec<GateKind>,

    /// Minimum response length accepted by response validation
    #[serde(default = "default_min_response_length")]
    pub min_response_length: usize,

    /// JSON document with agent-scoped hard limits
    #[serde(default = "default_hard_limits_path")]
    pub hard_limits_path: PathBuf,

    /// Minimum structural score for a soft pass
    #[serde(default = "default_structural_threshold")]
    pub structural_pass_threshold: f32,
}

/// Build execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Retries after a failed gate run
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Autonomy level override (otherwise taken from the environment)
    #[serde(default)]
    pub autonomy_level: Option<u8>,
}

/// Kinds of validation gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateKind {
    /// Non-empty, minimum length, error-keyword heuristic
    ResponseValidation,
    /// Structural tag extraction with soft-pass scoring
    StructuralTags,
    /// Embedded JSON shape against the agent schema
    Schema,
    /// Sandboxed type-check of extracted code
    Typecheck,
    /// Sandboxed test execution of extracted code
    Tests,
    /// LLM-backed semantic validation
    Semantic,
}

impl GateKind {
    /// Gate name reported in results
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseValidation => "response-validation",
            Self::StructuralTags => "structural-tags",
            Self::Schema => "schema",
            Self::Typecheck => "typecheck",
            Self::Tests => "tests",
            Self::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// Default value providers
fn default_true() -> bool {
    true
}

fn default_request_path() -> PathBuf {
    PathBuf::from(".nova/pending-approval.json")
}

fn default_response_path() -> PathBuf {
    PathBuf::from(".nova/approval-response.json")
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_gate_sequence() -> Vec<GateKind> {
    vec![
        GateKind::ResponseValidation,
        GateKind::StructuralTags,
        GateKind::Schema,
        GateKind::Typecheck,
        GateKind::Tests,
        GateKind::Semantic,
    ]
}

fn default_min_response_length() -> usize {
    50
}

fn default_hard_limits_path() -> PathBuf {
    PathBuf::from(".nova/hard-limits.json")
}

fn default_structural_threshold() -> f32 {
    0.5
}

fn default_max_retries() -> u32 {
    2
}

impl NovaConfig {
    /// Load configuration from `.nova/config.toml` or use defaults
    ///
    /// Relative paths in the loaded configuration are resolved against `repo_root`.
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".nova/config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| NovaError::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            Self::default()
        };

        config.resolve_paths(repo_root);
        Ok(config)
    }

    /// Write default configuration to `.nova/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".nova");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| NovaError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    fn resolve_paths(&mut self, repo_root: &Path) {
        for path in [
            &mut self.approval.request_path,
            &mut self.approval.response_path,
            &mut self.gates.hard_limits_path,
        ] {
            if path.is_relative() {
                *path = repo_root.join(&*path);
            }
        }
    }

    /// Whether a module is enabled by configuration alone
    pub fn feature_enabled(&self, module: &str) -> Option<bool> {
        self.features.get(module).copied()
    }
}

impl ApprovalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            request_path: default_request_path(),
            response_path: default_response_path(),
            poll_interval_ms: default_poll_interval_ms(),
            watch: true,
        }
    }
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sequence: default_gate_sequence(),
            min_response_length: default_min_response_length(),
            hard_limits_path: default_hard_limits_path(),
            structural_pass_threshold: default_structural_threshold(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            autonomy_level: None,
        }
    }
}

/// Parse an autonomy level, accepting only 1-5
pub fn parse_autonomy_level(raw: &str) -> Option<u8> {
    match raw.trim().parse::<u8>() {
        Ok(level @ 1..=5) => Some(level),
        _ => None,
    }
}

/// Autonomy level from the environment, if set and valid
pub fn autonomy_level_from_env() -> Option<u8> {
    let raw = std::env::var(AUTONOMY_ENV).ok()?;
    let level = parse_autonomy_level(&raw);
    if level.is_none() {
        tracing::warn!("Ignoring invalid {}={:?}", AUTONOMY_ENV, raw);
    }
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = NovaConfig::default();
        assert!(!config.approval.enabled);
        assert!(config.gates.enabled);
        assert_eq!(config.gates.sequence.len(), 6);
        assert_eq!(config.gates.sequence[0], GateKind::ResponseValidation);
        assert_eq!(config.build.max_retries, 2);
    }

    #[test]
    fn test_load_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = NovaConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.approval.poll_interval_ms, 500);
        assert_eq!(
            config.approval.request_path,
            dir.path().join(".nova/pending-approval.json")
        );
    }

    #[test]
    fn test_load_partial_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".nova")).unwrap();
        std::fs::write(
            dir.path().join(".nova/config.toml"),
            r#"
[approval]
enabled = true
poll_interval_ms = 50

[gates]
sequence = ["response-validation", "semantic"]

[features]
memory = false
"#,
        )
        .unwrap();

        let config = NovaConfig::load_or_default(dir.path()).unwrap();
        assert!(config.approval.enabled);
        assert_eq!(config.approval.poll_interval(), Duration::from_millis(50));
        assert_eq!(
            config.gates.sequence,
            vec![GateKind::ResponseValidation, GateKind::Semantic]
        );
        assert_eq!(config.gates.min_response_length, 50);
        assert_eq!(config.feature_enabled("memory"), Some(false));
        assert_eq!(config.feature_enabled("tracing"), None);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".nova")).unwrap();
        std::fs::write(dir.path().join(".nova/config.toml"), "[gates\nbroken").unwrap();

        let err = NovaConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, NovaError::Config(_)));
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = NovaConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());

        let config = NovaConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.gates.sequence.len(), 6);
    }

    #[test]
    fn test_parse_autonomy_level() {
        assert_eq!(parse_autonomy_level("1"), Some(1));
        assert_eq!(parse_autonomy_level(" 5 "), Some(5));
        assert_eq!(parse_autonomy_level("0"), None);
        assert_eq!(parse_autonomy_level("6"), None);
        assert_eq!(parse_autonomy_level("high"), None);
    }
}

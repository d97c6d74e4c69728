//! Sandboxed type-check and test-runner contract

use async_trait::async_trait;
use nova_core::Result;
use serde::{Deserialize, Serialize};

/// A fenced code block extracted from a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    /// Info string after the opening fence (may be empty)
    pub language: String,
    pub code: String,
}

impl CodeBlock {
    /// Whether the block holds program source rather than data or prose
    pub fn is_source(&self) -> bool {
        !matches!(
            self.language.as_str(),
            "json" | "md" | "markdown" | "text" | "txt" | "yaml" | "yml" | "toml" | "sh" | "bash"
                | "shell" | "console"
        )
    }
}

/// Outcome of a sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub success: bool,
    /// Compiler or test-runner output
    pub diagnostics: String,
}

/// Isolated execution of extracted code
///
/// Return `NovaError::SandboxUnavailable` when the sandbox cannot run at
/// all; gates treat that as a skip rather than a failure.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn type_check(&self, blocks: &[CodeBlock]) -> Result<SandboxReport>;

    async fn run_tests(&self, blocks: &[CodeBlock]) -> Result<SandboxReport>;
}

/// Extract every fenced code block, in order
///
/// An unterminated final fence runs to the end of the text.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(info) = trimmed.strip_prefix("```") {
            match current.take() {
                Some((language, lines)) => blocks.push(CodeBlock {
                    language,
                    code: lines.join("\n"),
                }),
                None => {
                    let language = info
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_lowercase();
                    current = Some((language, Vec::new()));
                }
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((language, lines)) = current {
        blocks.push(CodeBlock {
            language,
            code: lines.join("\n"),
        });
    }

    blocks
}

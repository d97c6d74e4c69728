//! Unified error types for Nova

use thiserror::Error;

/// Unified error type for all Nova operations
#[derive(Error, Debug)]
pub enum NovaError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown agent: {0}")]
    InvalidAgent(String),

    // Planning errors
    #[error("Decomposition error: {0}")]
    Decomposition(String),

    // Validation errors
    #[error("Hard limit violated: {0}")]
    HardLimit(String),

    #[error("Gate error: {0}")]
    Gate(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    // Approval errors
    #[error("Approval {0} was cancelled")]
    ApprovalCancelled(String),

    #[error("Approval transport error: {0}")]
    ApprovalTransport(String),

    // Hook and handoff errors
    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Handoff collector error: {0}")]
    Collector(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl NovaError {
    /// True when the error is a user-initiated approval cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::ApprovalCancelled(_))
    }
}

/// Result type alias using NovaError
pub type Result<T> = std::result::Result<T, NovaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguishable() {
        let cancelled = NovaError::ApprovalCancelled("approval-1".to_string());
        assert!(cancelled.is_cancellation());
        assert_eq!(cancelled.to_string(), "Approval approval-1 was cancelled");

        let io = NovaError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(!io.is_cancellation());
    }
}

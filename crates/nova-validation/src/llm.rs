//! Language-model invocation contract

use async_trait::async_trait;
use nova_core::{Agent, Result};

/// Something that answers a prompt on behalf of an agent
///
/// Implementations live outside this crate (HTTP clients, local models,
/// test doubles). Failures are reported as `NovaError::Llm`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, agent: Agent) -> Result<String>;
}

//! Prompt executor trait — the agent collaborator used by the scheduler.

use async_trait::async_trait;

use crate::error::Result;

/// Turns a text prompt into a text response.
///
/// In the full assistant this is the conversational agent; the scheduler only
/// sees the prompt going in and the text coming out. Any timeout policy belongs
/// to the implementation.
#[async_trait]
pub trait PromptExecutor: Send + Sync {
    /// Executor name for logs.
    fn name(&self) -> &str {
        "executor"
    }

    async fn execute(&self, prompt: &str) -> Result<String>;
}

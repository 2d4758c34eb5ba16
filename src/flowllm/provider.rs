//! The LLM provider boundary the core consumes.
//!
//! Orchestration never talks to a vendor API itself; agent handlers do,
//! through this narrow trait. Concrete implementations (OpenAI, Anthropic,
//! local inference servers) live outside the core and are injected at
//! handler construction.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::flowllm::context::RunContext;
use crate::flowllm::errors::FlowError;
use crate::flowllm::stream::UsageTotals;

/// A completed provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The generated text.
    pub content: String,
    /// Token accounting, when the provider reports it.
    pub usage: Option<UsageTotals>,
}

/// Minimal language-model boundary: one-shot calls, token streaming, and
/// embeddings.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a full response for a prompt.
    async fn call(&self, ctx: &RunContext, prompt: &str) -> Result<ProviderResponse, FlowError>;

    /// Stream a response token-by-token. Providers without streaming support
    /// inherit this default, which yields the full response as one fragment.
    async fn stream(
        &self,
        ctx: &RunContext,
        prompt: &str,
    ) -> Result<mpsc::Receiver<String>, FlowError> {
        let response = self.call(ctx, prompt).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(response.content);
        Ok(rx)
    }

    /// Embed a batch of texts. Providers without embedding support inherit
    /// this default, which refuses.
    async fn embeddings(
        &self,
        _ctx: &RunContext,
        _texts: &[String],
    ) -> Result<Vec<Vec<f32>>, FlowError> {
        Err(FlowError::ExecutionFailed(
            "provider does not support embeddings".to_string(),
        ))
    }

    /// The model identifier, for logging and accounting.
    fn model_name(&self) -> &str;
}

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{
    BatchMetadata, BatchRequest, Capability, LlmConfig, PromptlineError, ProviderBatchResult,
    Result, TokenUsage, Value,
};

/// Incremental output of a streaming call.
///
/// Only the terminal chunk carries usage, and its text is always empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn terminal(usage: TokenUsage) -> Self {
        Self {
            text: String::new(),
            usage: Some(usage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.usage.is_some()
    }
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub usage: TokenUsage,
    /// Vendor payload as received. Opaque to everything in this workspace.
    pub raw: Value,
}

/// The contract every vendor adapter implements.
///
/// Streaming and batch are optional capabilities: callers check
/// [`Provider::supports_streaming`] / [`Provider::supports_batch`] first, and
/// the default method bodies fail with a capability error naming the provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Lazy, finite and not restartable. Ends with exactly one terminal chunk.
    fn invoke_stream(&self, _prompt: &str, _config: &LlmConfig) -> Result<ChunkStream> {
        Err(PromptlineError::capability(self.name(), Capability::Streaming))
    }

    fn supports_batch(&self) -> bool {
        false
    }

    async fn create_batch(
        &self,
        _requests: Vec<BatchRequest>,
        _config: &LlmConfig,
    ) -> Result<BatchMetadata> {
        Err(PromptlineError::capability(self.name(), Capability::Batch))
    }

    /// Reflects the vendor's current state; safe to call repeatedly.
    async fn retrieve_batch(
        &self,
        _metadata: &BatchMetadata,
        _config: &LlmConfig,
    ) -> Result<ProviderBatchResult> {
        Err(PromptlineError::capability(self.name(), Capability::Batch))
    }
}

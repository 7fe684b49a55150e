//! Vendor adapters behind the [`Provider`] contract.
//!
//! Every adapter takes a prompt plus an [`LlmConfig`] and returns unified
//! responses, chunk streams and batch results. [`create_provider`] picks one
//! from the config's `provider` discriminant.

mod factory;
mod http;
#[cfg(feature = "ollama")]
mod ollama;
mod stream;

// OpenAI-compatible client (always available)
pub mod openai_compatible;

// Provider-specific clients (feature-gated)
pub mod providers;

pub use factory::create_provider;
pub use openai_compatible::{ChatCompletionRequest, ChatMessage, OpenAiCompatibleClient};
pub use promptline_core::{
    BatchMetadata, BatchRequest, ChunkStream, LlmConfig, Provider, ProviderBatchResult,
    ProviderResponse, StreamChunk, TokenUsage,
};
pub use stream::{normalize, Framing, UsageAccumulator};

#[cfg(feature = "ollama")]
pub use ollama::OllamaClient;

#[cfg(feature = "anthropic")]
pub use providers::anthropic::AnthropicClient;
#[cfg(feature = "google")]
pub use providers::google::GoogleClient;
#[cfg(feature = "openai")]
pub use providers::openai::OpenAiClient;

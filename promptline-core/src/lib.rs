mod batch;
mod config;
mod error;
mod executable;
mod parser;
mod pipeline;
mod provider;
mod usage;

pub use batch::{
    correlation_id, parse_correlation_id, BatchItemCollector, BatchItemResult, BatchMetadata,
    BatchRequest, BatchResult, BatchStatus, ItemStatus, ProviderBatchItem, ProviderBatchResult,
    RequestCounts,
};
pub use config::{
    AnthropicConfig, CommonConfig, CustomConfig, GoogleConfig, LlmConfig, OllamaConfig,
    OpenAiConfig, ANTHROPIC, GOOGLE, OLLAMA, OPENAI,
};
pub use error::{Capability, PromptlineError, Result};
pub use executable::{Executable, FnStage};
pub use parser::{FnParser, JsonParser, OutputParser, StrParser};
pub use pipeline::{ExecutableExt, Pipeline};
pub use provider::{ChunkStream, Provider, ProviderResponse, StreamChunk};
pub use usage::{TokenUsage, UsageLedger, UsageRecord, UsageTotals};

pub type Value = serde_json::Value;

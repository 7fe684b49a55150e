//! One prompt in, one typed answer out, for any supported model vendor.
//!
//! ```no_run
//! use promptline::{LlmConfig, Node, StrParser};
//!
//! # async fn run() -> promptline::Result<()> {
//! let config = LlmConfig::anthropic("claude-sonnet-4-5").with_max_tokens(512);
//! let node: Node<String, String> = Node::builder()
//!     .prompt_fn(|topic: &String| format!("Explain {topic} in one sentence."))
//!     .parser(StrParser)
//!     .config(config)
//!     .build()?;
//!
//! let answer = node.execute("borrowing".to_string()).await?;
//! println!("{answer} ({} tokens)", node.total_token_usage().total_tokens);
//! # Ok(())
//! # }
//! ```

pub use promptline_core::*;
pub use promptline_llm::{create_provider, Framing, OpenAiCompatibleClient, UsageAccumulator};
pub use promptline_node::{Node, NodeBuilder};
pub use promptline_prompt::{evaluate, ExprError, PromptTemplate};

#[cfg(feature = "anthropic")]
pub use promptline_llm::AnthropicClient;
#[cfg(feature = "google")]
pub use promptline_llm::GoogleClient;
#[cfg(feature = "ollama")]
pub use promptline_llm::OllamaClient;
#[cfg(feature = "openai")]
pub use promptline_llm::OpenAiClient;

pub mod prelude {
    pub use promptline_core::{
        Executable, ExecutableExt, JsonParser, LlmConfig, OutputParser, Provider, StrParser,
    };
    pub use promptline_node::Node;
}

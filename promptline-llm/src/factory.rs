//! Picks an adapter from the config's `provider` discriminant.

use std::sync::Arc;

use promptline_core::{LlmConfig, PromptlineError, Provider, Result};

use crate::openai_compatible::OpenAiCompatibleClient;

/// Returns the adapter for `config`.
///
/// Known providers map to their dedicated clients; anything else is served by
/// [`OpenAiCompatibleClient`]. A known provider whose cargo feature is
/// disabled is reported as [`PromptlineError::InvalidConfig`].
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config {
        LlmConfig::OpenAi(_) => openai()?,
        LlmConfig::Anthropic(_) => anthropic()?,
        LlmConfig::Google(_) => google()?,
        LlmConfig::Ollama(_) => ollama()?,
        LlmConfig::Custom(custom) => Arc::new(OpenAiCompatibleClient::new(&custom.provider)?),
    };
    tracing::debug!(provider = provider.name(), model = config.model(), "resolved provider");
    Ok(provider)
}

#[allow(dead_code)]
fn disabled(provider: &str) -> PromptlineError {
    PromptlineError::InvalidConfig(format!(
        "provider '{provider}' is not enabled; build with the '{provider}' feature"
    ))
}

#[cfg(feature = "openai")]
fn openai() -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(crate::providers::openai::OpenAiClient::new()?))
}

#[cfg(not(feature = "openai"))]
fn openai() -> Result<Arc<dyn Provider>> {
    Err(disabled(promptline_core::OPENAI))
}

#[cfg(feature = "anthropic")]
fn anthropic() -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(crate::providers::anthropic::AnthropicClient::new()?))
}

#[cfg(not(feature = "anthropic"))]
fn anthropic() -> Result<Arc<dyn Provider>> {
    Err(disabled(promptline_core::ANTHROPIC))
}

#[cfg(feature = "google")]
fn google() -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(crate::providers::google::GoogleClient::new()?))
}

#[cfg(not(feature = "google"))]
fn google() -> Result<Arc<dyn Provider>> {
    Err(disabled(promptline_core::GOOGLE))
}

#[cfg(feature = "ollama")]
fn ollama() -> Result<Arc<dyn Provider>> {
    Ok(Arc::new(crate::ollama::OllamaClient::new()?))
}

#[cfg(not(feature = "ollama"))]
fn ollama() -> Result<Arc<dyn Provider>> {
    Err(disabled(promptline_core::OLLAMA))
}

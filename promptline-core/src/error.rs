use thiserror::Error;

/// Capability a provider may or may not offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Streaming,
    Batch,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Streaming => f.write_str("streaming"),
            Capability::Batch => f.write_str("batch"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptlineError {
    #[error("Missing required config field '{field}' for provider '{provider}'")]
    Config { provider: String, field: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Provider '{provider}' does not support {capability}")]
    Capability {
        provider: String,
        capability: Capability,
    },
    #[error("Provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },
    #[error("Parsing failed on output '{output}': {reason}")]
    Parse { output: String, reason: String },
    #[error("Serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PromptlineError {
    pub fn config(provider: impl Into<String>, field: impl Into<String>) -> Self {
        PromptlineError::Config {
            provider: provider.into(),
            field: field.into(),
        }
    }

    pub fn capability(provider: impl Into<String>, capability: Capability) -> Self {
        PromptlineError::Capability {
            provider: provider.into(),
            capability,
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl ToString) -> Self {
        PromptlineError::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn parse(output: impl Into<String>, reason: impl ToString) -> Self {
        PromptlineError::Parse {
            output: output.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = PromptlineError> = std::result::Result<T, E>;

//! Provider-tagged model configuration.
//!
//! On the wire a config is one flat JSON object whose `provider` field picks
//! the variant:
//!
//! ```json
//! { "provider": "anthropic", "model": "claude-sonnet-4-5", "maxTokens": 1024 }
//! ```
//!
//! Unknown `provider` strings deserialize into [`LlmConfig::Custom`] rather
//! than failing, so OpenAI-compatible gateways work without a new variant.
//! Vendor-mandated fields are checked by the adapter at call time.

use secrecy::SecretString;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{PromptlineError, Result};

pub const OPENAI: &str = "openai";
pub const ANTHROPIC: &str = "anthropic";
pub const GOOGLE: &str = "google";
pub const OLLAMA: &str = "ollama";

/// Fields every variant carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Free-form vendor options merged into the request body last.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl CommonConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// `low`, `medium` or `high` for reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub web_search: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnthropicConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Enables extended thinking with this token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub web_search: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_max_uses: Option<u32>,
    #[serde(default)]
    pub web_fetch: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
    #[serde(default)]
    pub include_thoughts: bool,
    #[serde(default)]
    pub google_search: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
}

/// Any provider outside the known set, served by the OpenAI-compatible adapter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub provider: String,
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

#[derive(Clone, Debug)]
pub enum LlmConfig {
    OpenAi(OpenAiConfig),
    Anthropic(AnthropicConfig),
    Google(GoogleConfig),
    Ollama(OllamaConfig),
    Custom(CustomConfig),
}

impl LlmConfig {
    pub fn openai(model: impl Into<String>) -> Self {
        LlmConfig::OpenAi(OpenAiConfig {
            common: CommonConfig::new(model),
            ..OpenAiConfig::default()
        })
    }

    pub fn anthropic(model: impl Into<String>) -> Self {
        LlmConfig::Anthropic(AnthropicConfig {
            common: CommonConfig::new(model),
            ..AnthropicConfig::default()
        })
    }

    pub fn google(model: impl Into<String>) -> Self {
        LlmConfig::Google(GoogleConfig {
            common: CommonConfig::new(model),
            ..GoogleConfig::default()
        })
    }

    pub fn ollama(model: impl Into<String>) -> Self {
        LlmConfig::Ollama(OllamaConfig {
            common: CommonConfig::new(model),
            ..OllamaConfig::default()
        })
    }

    pub fn custom(provider: impl Into<String>, model: impl Into<String>) -> Self {
        LlmConfig::Custom(CustomConfig {
            provider: provider.into(),
            common: CommonConfig::new(model),
            ..CustomConfig::default()
        })
    }

    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|err| PromptlineError::InvalidConfig(err.to_string()))
    }

    /// The discriminant string, e.g. `"openai"`.
    pub fn provider(&self) -> &str {
        match self {
            LlmConfig::OpenAi(_) => OPENAI,
            LlmConfig::Anthropic(_) => ANTHROPIC,
            LlmConfig::Google(_) => GOOGLE,
            LlmConfig::Ollama(_) => OLLAMA,
            LlmConfig::Custom(config) => &config.provider,
        }
    }

    pub fn common(&self) -> &CommonConfig {
        match self {
            LlmConfig::OpenAi(config) => &config.common,
            LlmConfig::Anthropic(config) => &config.common,
            LlmConfig::Google(config) => &config.common,
            LlmConfig::Ollama(config) => &config.common,
            LlmConfig::Custom(config) => &config.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonConfig {
        match self {
            LlmConfig::OpenAi(config) => &mut config.common,
            LlmConfig::Anthropic(config) => &mut config.common,
            LlmConfig::Google(config) => &mut config.common,
            LlmConfig::Ollama(config) => &mut config.common,
            LlmConfig::Custom(config) => &mut config.common,
        }
    }

    pub fn model(&self) -> &str {
        &self.common().model
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.common_mut().max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.common_mut().temperature = Some(temperature);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.common_mut().options.insert(key.into(), value);
        self
    }

    /// `maxTokens`, or a config error naming it.
    pub fn require_max_tokens(&self) -> Result<u32> {
        self.common()
            .max_tokens
            .ok_or_else(|| PromptlineError::config(self.provider(), "maxTokens"))
    }
}

impl<'de> Deserialize<'de> for LlmConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let provider = value
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::missing_field("provider"))?
            .to_string();

        let config = match provider.as_str() {
            OPENAI => serde_json::from_value(value).map(LlmConfig::OpenAi),
            ANTHROPIC => serde_json::from_value(value).map(LlmConfig::Anthropic),
            GOOGLE => serde_json::from_value(value).map(LlmConfig::Google),
            OLLAMA => serde_json::from_value(value).map(LlmConfig::Ollama),
            _ => serde_json::from_value(value).map(LlmConfig::Custom),
        };
        config.map_err(D::Error::custom)
    }
}

impl Serialize for LlmConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let value = match self {
            LlmConfig::OpenAi(config) => serde_json::to_value(config),
            LlmConfig::Anthropic(config) => serde_json::to_value(config),
            LlmConfig::Google(config) => serde_json::to_value(config),
            LlmConfig::Ollama(config) => serde_json::to_value(config),
            LlmConfig::Custom(config) => serde_json::to_value(config),
        };
        let mut value = value.map_err(S::Error::custom)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "provider".to_string(),
                Value::String(self.provider().to_string()),
            );
        }
        value.serialize(serializer)
    }
}

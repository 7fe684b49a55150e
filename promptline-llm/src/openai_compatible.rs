//! Chat-completions wire format and the generic adapter for any
//! OpenAI-compatible endpoint (Groq, Together, vLLM, LM Studio, ...).
//!
//! The OpenAI adapter reuses the wire types and helpers defined here.

use async_trait::async_trait;
use promptline_core::{
    ChunkStream, CustomConfig, LlmConfig, PromptlineError, Provider, ProviderResponse, Result,
    TokenUsage, Value,
};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::{
    build_http_client, ensure_success, join_url, merge_options, read_json, transport_error,
};
use crate::stream::{normalize, Framing, UsageAccumulator};

pub(crate) const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for chat completions endpoint
#[derive(Serialize, Debug, Clone, Default)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Serialize, Debug, Clone, Copy)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Non-streaming response from chat completions
#[derive(Deserialize, Debug, Clone)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: String,
    pub content: Option<String>,
    /// Returned by some compatible servers (DeepSeek, vLLM) for reasoning models.
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: Option<u64>,
}

impl Usage {
    pub fn to_token_usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            thinking_tokens: self
                .completion_tokens_details
                .as_ref()
                .and_then(|details| details.reasoning_tokens),
            ..TokenUsage::default()
        }
    }
}

/// Streaming chunk (server-sent events)
#[derive(Deserialize, Debug, Clone)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Only on the final chunk when `stream_options.include_usage` is set.
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Chat-completions parameters common to OpenAI and compatible servers.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChatParams {
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub reasoning_effort: Option<String>,
}

/// Builds the JSON body for one prompt, with `options` merged last.
pub(crate) fn chat_body(
    prompt: &str,
    config: &LlmConfig,
    params: ChatParams,
    stream: bool,
) -> Result<Value> {
    let common = config.common();
    let request = ChatCompletionRequest {
        model: common.model.clone(),
        messages: vec![ChatMessage::user(prompt)],
        temperature: common.temperature,
        max_tokens: common.max_tokens,
        top_p: params.top_p,
        frequency_penalty: params.frequency_penalty,
        presence_penalty: params.presence_penalty,
        reasoning_effort: params.reasoning_effort,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    };
    let mut body = serde_json::to_value(request)?;
    merge_options(&mut body, &common.options);
    Ok(body)
}

pub(crate) fn chat_response(
    provider: &str,
    response: ChatCompletionResponse,
    raw: Value,
) -> Result<ProviderResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PromptlineError::provider(provider, "no choices returned"))?;
    Ok(ProviderResponse {
        content: choice.message.content.unwrap_or_default(),
        thinking: choice.message.reasoning_content,
        usage: response
            .usage
            .map(|usage| usage.to_token_usage())
            .unwrap_or_default(),
        raw,
    })
}

/// Decodes one chat-completions SSE payload.
pub(crate) fn chat_stream_event(
    payload: &str,
    usage: &mut UsageAccumulator,
) -> Result<Vec<String>> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(payload).map_err(|err| PromptlineError::parse(payload, err))?;
    if let Some(reported) = chunk.usage {
        let reported = reported.to_token_usage();
        usage.set_input(reported.input_tokens);
        usage.set_output(reported.output_tokens);
        if let Some(thinking) = reported.thinking_tokens {
            usage.set_thinking(thinking);
        }
    }
    Ok(chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect())
}

pub(crate) fn bearer(request: RequestBuilder, api_key: Option<&SecretString>) -> RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key.expose_secret()),
        None => request,
    }
}

pub(crate) async fn send_chat(
    http: &Client,
    provider: &str,
    url: &str,
    api_key: Option<&SecretString>,
    body: &Value,
) -> Result<ProviderResponse> {
    tracing::debug!(provider, url, "sending chat completion");
    let response = bearer(http.post(url), api_key)
        .json(body)
        .send()
        .await
        .map_err(|err| transport_error(provider, err))?;
    let raw: Value = read_json(provider, response).await?;
    let parsed: ChatCompletionResponse = serde_json::from_value(raw.clone())
        .map_err(|err| PromptlineError::provider(provider, format!("unexpected response: {err}")))?;
    chat_response(provider, parsed, raw)
}

/// Sends an already authorized streaming request and normalizes the SSE body.
pub(crate) fn stream_chat(provider: String, request: RequestBuilder) -> ChunkStream {
    use futures::StreamExt;

    futures::stream::once(async move {
        let response = request
            .send()
            .await
            .map_err(|err| transport_error(&provider, err))?;
        let response = ensure_success(&provider, response).await?;
        Ok::<_, PromptlineError>(normalize(
            provider,
            response.bytes_stream(),
            Framing::Sse,
            chat_stream_event,
        ))
    })
    .flat_map(|result| match result {
        Ok(stream) => stream,
        Err(err) => futures::stream::iter(vec![Err(err)]).boxed(),
    })
    .boxed()
}

/// Adapter for providers outside the known set.
///
/// `baseUrl` is required; the key comes from `apiKey` or `<PROVIDER>_API_KEY`
/// and may be absent for local servers. Batch jobs are not supported.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    provider: String,
    http: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(provider: impl Into<String>) -> Result<Self> {
        let provider = provider.into();
        let http = build_http_client(&provider)?;
        Ok(Self { provider, http })
    }

    fn custom_config<'a>(&self, config: &'a LlmConfig) -> Result<&'a CustomConfig> {
        match config {
            LlmConfig::Custom(custom) => Ok(custom),
            other => Err(PromptlineError::InvalidConfig(format!(
                "openai-compatible adapter '{}' received config for provider '{}'",
                self.provider,
                other.provider()
            ))),
        }
    }

    fn endpoint(&self, config: &CustomConfig) -> Result<String> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| PromptlineError::config(&self.provider, "baseUrl"))?;
        Url::parse(base_url).map_err(|err| {
            PromptlineError::InvalidConfig(format!("invalid baseUrl '{base_url}': {err}"))
        })?;
        Ok(join_url(base_url, CHAT_COMPLETIONS_PATH))
    }

    fn api_key(&self, config: &CustomConfig) -> Option<SecretString> {
        if let Some(key) = &config.api_key {
            return Some(key.clone());
        }
        let var = format!(
            "{}_API_KEY",
            self.provider.to_uppercase().replace(['-', '.', ' '], "_")
        );
        std::env::var(var)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretString::new)
    }

    fn params(config: &CustomConfig) -> ChatParams {
        ChatParams {
            top_p: config.top_p,
            ..ChatParams::default()
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse> {
        let custom = self.custom_config(config)?;
        let url = self.endpoint(custom)?;
        let body = chat_body(prompt, config, Self::params(custom), false)?;
        send_chat(
            &self.http,
            &self.provider,
            &url,
            self.api_key(custom).as_ref(),
            &body,
        )
        .await
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn invoke_stream(&self, prompt: &str, config: &LlmConfig) -> Result<ChunkStream> {
        let custom = self.custom_config(config)?;
        let url = self.endpoint(custom)?;
        let body = chat_body(prompt, config, Self::params(custom), true)?;
        let request = bearer(self.http.post(&url), self.api_key(custom).as_ref()).json(&body);
        Ok(stream_chat(self.provider.clone(), request))
    }
}

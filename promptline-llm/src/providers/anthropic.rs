//! Anthropic Messages API adapter, including Message Batches.

use async_trait::async_trait;
use promptline_core::{
    AnthropicConfig, BatchItemCollector, BatchMetadata, BatchRequest, BatchStatus, ChunkStream,
    ItemStatus, LlmConfig, PromptlineError, Provider, ProviderBatchItem, ProviderBatchResult,
    ProviderResponse, RequestCounts, Result, TokenUsage, Value, ANTHROPIC,
};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::http::{
    build_http_client, ensure_success, join_url, merge_options, parse_jsonl, read_json, read_text,
    resolve_api_key, transport_error,
};
use crate::stream::{normalize, Framing, UsageAccumulator};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const WEB_FETCH_BETA: &str = "web-fetch-2025-09-10";
const MESSAGES_PATH: &str = "/v1/messages";
const BATCHES_PATH: &str = "/v1/messages/batches";
const API_KEY_ENV: &[&str] = &["ANTHROPIC_API_KEY"];

/// Best-effort thinking count for responses that only report a combined
/// output figure: output tokens minus roughly one token per four characters
/// of visible text, never below zero.
pub(crate) fn estimate_thinking_tokens(output_tokens: u64, content_chars: usize) -> u64 {
    let content_tokens = (content_chars as u64).div_ceil(4);
    output_tokens.saturating_sub(content_tokens)
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    base_url: Option<String>,
}

impl AnthropicClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_http_client(ANTHROPIC)?,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn anthropic_config(config: &LlmConfig) -> Result<&AnthropicConfig> {
        match config {
            LlmConfig::Anthropic(anthropic) => Ok(anthropic),
            other => Err(PromptlineError::InvalidConfig(format!(
                "anthropic adapter received config for provider '{}'",
                other.provider()
            ))),
        }
    }

    fn url(&self, config: &AnthropicConfig, path: &str) -> String {
        let base = config
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .unwrap_or(ANTHROPIC_BASE_URL);
        join_url(base, path)
    }

    fn headers(
        request: RequestBuilder,
        config: &AnthropicConfig,
        api_key: &SecretString,
    ) -> RequestBuilder {
        let request = request
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION);
        if config.web_fetch {
            request.header("anthropic-beta", WEB_FETCH_BETA)
        } else {
            request
        }
    }

    /// Validates the config and resolves the key; nothing here touches the
    /// network.
    fn prepare<'a>(config: &'a LlmConfig) -> Result<(&'a AnthropicConfig, u32, SecretString)> {
        let anthropic = Self::anthropic_config(config)?;
        let max_tokens = config.require_max_tokens()?;
        let api_key = resolve_api_key(ANTHROPIC, anthropic.api_key.as_ref(), API_KEY_ENV)?;
        Ok((anthropic, max_tokens, api_key))
    }
}

fn message_params(prompt: &str, config: &AnthropicConfig, max_tokens: u32, stream: bool) -> Value {
    let common = &config.common;
    let mut body = json!({
        "model": common.model,
        "max_tokens": max_tokens,
        "messages": [{ "role": "user", "content": prompt }],
    });
    if let Value::Object(map) = &mut body {
        if stream {
            map.insert("stream".into(), json!(true));
        }
        if let Some(temperature) = common.temperature {
            map.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = config.top_p {
            map.insert("top_p".into(), json!(top_p));
        }
        if let Some(top_k) = config.top_k {
            map.insert("top_k".into(), json!(top_k));
        }
        if let Some(budget) = config.thinking_budget {
            map.insert(
                "thinking".into(),
                json!({ "type": "enabled", "budget_tokens": budget }),
            );
        }

        let mut tools = Vec::new();
        if config.web_search {
            let mut tool = json!({ "type": "web_search_20250305", "name": "web_search" });
            if let (Some(max_uses), Value::Object(tool)) = (config.web_search_max_uses, &mut tool)
            {
                tool.insert("max_uses".into(), json!(max_uses));
            }
            tools.push(tool);
        }
        if config.web_fetch {
            tools.push(json!({ "type": "web_fetch_20250910", "name": "web_fetch" }));
        }
        if !tools.is_empty() {
            map.insert("tools".into(), Value::Array(tools));
        }
    }
    merge_options(&mut body, &common.options);
    body
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessageUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    server_tool_use: Option<ServerToolUse>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerToolUse {
    #[serde(default)]
    web_search_requests: Option<u64>,
    #[serde(default)]
    web_fetch_requests: Option<u64>,
}

struct DecodedMessage {
    content: String,
    thinking: Option<String>,
    usage: TokenUsage,
}

fn decode_message(message: MessageResponse, config: &AnthropicConfig) -> DecodedMessage {
    let mut content = String::new();
    let mut thinking = String::new();
    for block in message.content {
        match block.kind.as_str() {
            "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => thinking.push_str(block.thinking.as_deref().unwrap_or_default()),
            _ => {}
        }
    }

    let usage = message.usage.unwrap_or_default();
    let output_tokens = usage.output_tokens.unwrap_or(0);
    let mut token_usage = TokenUsage::new(usage.input_tokens.unwrap_or(0), output_tokens);
    if config.thinking_budget.is_some() {
        token_usage.thinking_tokens = Some(estimate_thinking_tokens(
            output_tokens,
            content.chars().count(),
        ));
    }
    if let Some(tools) = usage.server_tool_use {
        if config.web_search {
            token_usage.search_calls = Some(tools.web_search_requests.unwrap_or(0));
        }
        if config.web_fetch {
            token_usage.fetch_calls = Some(tools.web_fetch_requests.unwrap_or(0));
        }
    }

    DecodedMessage {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        usage: token_usage,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StreamMessage },
    ContentBlockDelta { delta: StreamDelta },
    MessageDelta {
        #[serde(default)]
        usage: Option<MessageUsage>,
    },
    Error { error: StreamError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<MessageUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

/// Builds the per-stream SSE handler. Thinking deltas are not forwarded as
/// text; when a thinking budget is set the count is estimated from the text
/// seen so far each time the vendor reports cumulative output.
fn stream_handler(
    config: &AnthropicConfig,
) -> impl FnMut(&str, &mut UsageAccumulator) -> Result<Vec<String>> + Send + 'static {
    let thinking_enabled = config.thinking_budget.is_some();
    let web_search = config.web_search;
    let web_fetch = config.web_fetch;
    let mut content_chars = 0usize;

    move |payload, usage| {
        let event: StreamEvent =
            serde_json::from_str(payload).map_err(|err| PromptlineError::parse(payload, err))?;
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(reported) = message.usage {
                    if let Some(input) = reported.input_tokens {
                        usage.set_input(input);
                    }
                    if let Some(output) = reported.output_tokens {
                        usage.set_output(output);
                    }
                }
                Ok(Vec::new())
            }
            StreamEvent::ContentBlockDelta { delta } if delta.kind == "text_delta" => {
                let text = delta.text.unwrap_or_default();
                content_chars += text.chars().count();
                Ok(vec![text])
            }
            StreamEvent::ContentBlockDelta { .. } => Ok(Vec::new()),
            StreamEvent::MessageDelta { usage: reported } => {
                if let Some(reported) = reported {
                    if let Some(input) = reported.input_tokens {
                        usage.set_input(input);
                    }
                    if let Some(output) = reported.output_tokens {
                        usage.set_output(output);
                    }
                    if let Some(tools) = reported.server_tool_use {
                        if web_search {
                            usage.set_search_calls(tools.web_search_requests.unwrap_or(0));
                        }
                        if web_fetch {
                            usage.set_fetch_calls(tools.web_fetch_requests.unwrap_or(0));
                        }
                    }
                }
                if thinking_enabled {
                    usage.set_thinking(estimate_thinking_tokens(
                        usage.output_tokens(),
                        content_chars,
                    ));
                }
                Ok(Vec::new())
            }
            StreamEvent::Error { error } => Err(PromptlineError::provider(ANTHROPIC, error.message)),
            StreamEvent::Other => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageBatch {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: Option<MessageBatchCounts>,
    #[serde(default)]
    results_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBatchCounts {
    #[serde(default)]
    processing: usize,
    #[serde(default)]
    succeeded: usize,
    #[serde(default)]
    errored: usize,
    #[serde(default)]
    canceled: usize,
    #[serde(default)]
    expired: usize,
}

impl From<MessageBatchCounts> for RequestCounts {
    fn from(counts: MessageBatchCounts) -> Self {
        RequestCounts {
            total: counts.processing
                + counts.succeeded
                + counts.errored
                + counts.canceled
                + counts.expired,
            completed: counts.succeeded,
            failed: counts.errored,
            expired: counts.expired,
            cancelled: counts.canceled,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResultLine {
    custom_id: String,
    result: BatchResultBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BatchResultBody {
    Succeeded { message: MessageResponse },
    Errored {
        #[serde(default)]
        error: Value,
    },
    Canceled,
    Expired,
}

pub(crate) fn map_batch_status(status: &str) -> BatchStatus {
    match status {
        "in_progress" => BatchStatus::InProgress,
        "canceling" => BatchStatus::Cancelling,
        "ended" => BatchStatus::Completed,
        other => {
            tracing::warn!(provider = ANTHROPIC, status = other, "unknown batch status");
            BatchStatus::InProgress
        }
    }
}

fn decode_result_line(line: BatchResultLine, config: &AnthropicConfig) -> ProviderBatchItem {
    match line.result {
        BatchResultBody::Succeeded { message } => {
            let decoded = decode_message(message, config);
            ProviderBatchItem::success(line.custom_id, decoded.content, Some(decoded.usage))
        }
        BatchResultBody::Errored { error } => {
            let message = error
                .pointer("/error/message")
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            ProviderBatchItem::failure(line.custom_id, ItemStatus::Failed, message)
        }
        BatchResultBody::Canceled => {
            ProviderBatchItem::failure(line.custom_id, ItemStatus::Cancelled, "request canceled")
        }
        BatchResultBody::Expired => {
            ProviderBatchItem::failure(line.custom_id, ItemStatus::Expired, "request expired")
        }
    }
}

#[async_trait]
impl Provider for AnthropicClient {
    fn name(&self) -> &str {
        ANTHROPIC
    }

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse> {
        let (anthropic, max_tokens, api_key) = Self::prepare(config)?;
        let body = message_params(prompt, anthropic, max_tokens, false);
        let url = self.url(anthropic, MESSAGES_PATH);
        tracing::debug!(provider = ANTHROPIC, url = %url, "sending message");

        let response = Self::headers(self.http.post(&url), anthropic, &api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(ANTHROPIC, err))?;
        let raw: Value = read_json(ANTHROPIC, response).await?;
        let message: MessageResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            PromptlineError::provider(ANTHROPIC, format!("unexpected response: {err}"))
        })?;
        let decoded = decode_message(message, anthropic);

        Ok(ProviderResponse {
            content: decoded.content,
            thinking: decoded.thinking,
            usage: decoded.usage,
            raw,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn invoke_stream(&self, prompt: &str, config: &LlmConfig) -> Result<ChunkStream> {
        use futures::StreamExt;

        let (anthropic, max_tokens, api_key) = Self::prepare(config)?;
        let body = message_params(prompt, anthropic, max_tokens, true);
        let request = Self::headers(
            self.http.post(self.url(anthropic, MESSAGES_PATH)),
            anthropic,
            &api_key,
        )
        .json(&body);
        let handler = stream_handler(anthropic);

        Ok(futures::stream::once(async move {
            let response = request
                .send()
                .await
                .map_err(|err| transport_error(ANTHROPIC, err))?;
            let response = ensure_success(ANTHROPIC, response).await?;
            Ok::<_, PromptlineError>(normalize(
                ANTHROPIC.to_string(),
                response.bytes_stream(),
                Framing::Sse,
                handler,
            ))
        })
        .flat_map(|result| match result {
            Ok(stream) => stream,
            Err(err) => futures::stream::iter(vec![Err(err)]).boxed(),
        })
        .boxed())
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn create_batch(
        &self,
        requests: Vec<BatchRequest>,
        config: &LlmConfig,
    ) -> Result<BatchMetadata> {
        let (anthropic, max_tokens, api_key) = Self::prepare(config)?;
        let entries: Vec<Value> = requests
            .iter()
            .map(|request| {
                json!({
                    "custom_id": request.custom_id,
                    "params": message_params(&request.prompt, anthropic, max_tokens, false),
                })
            })
            .collect();

        let response = Self::headers(
            self.http.post(self.url(anthropic, BATCHES_PATH)),
            anthropic,
            &api_key,
        )
        .json(&json!({ "requests": entries }))
        .send()
        .await
        .map_err(|err| transport_error(ANTHROPIC, err))?;
        let batch: MessageBatch = read_json(ANTHROPIC, response).await?;

        Ok(BatchMetadata::new(
            batch.id,
            ANTHROPIC,
            anthropic.common.model.clone(),
            requests.len(),
        ))
    }

    async fn retrieve_batch(
        &self,
        metadata: &BatchMetadata,
        config: &LlmConfig,
    ) -> Result<ProviderBatchResult> {
        let anthropic = Self::anthropic_config(config)?;
        let api_key = resolve_api_key(ANTHROPIC, anthropic.api_key.as_ref(), API_KEY_ENV)?;

        let path = format!("{BATCHES_PATH}/{}", metadata.batch_id);
        let response = Self::headers(self.http.get(self.url(anthropic, &path)), anthropic, &api_key)
            .send()
            .await
            .map_err(|err| transport_error(ANTHROPIC, err))?;
        let batch: MessageBatch = read_json(ANTHROPIC, response).await?;

        let status = map_batch_status(&batch.processing_status);
        let request_counts = batch.request_counts.map(RequestCounts::from);
        if status != BatchStatus::Completed {
            return Ok(ProviderBatchResult {
                status,
                results: None,
                request_counts,
            });
        }

        let results_url = match batch.results_url {
            Some(url) => url,
            None => self.url(anthropic, &format!("{path}/results")),
        };
        let response = Self::headers(self.http.get(&results_url), anthropic, &api_key)
            .send()
            .await
            .map_err(|err| transport_error(ANTHROPIC, err))?;
        let body = read_text(ANTHROPIC, response).await?;

        let mut collector = BatchItemCollector::new();
        for line in parse_jsonl::<BatchResultLine>(ANTHROPIC, &body)? {
            collector.insert(decode_result_line(line, anthropic));
        }

        Ok(ProviderBatchResult {
            status,
            results: Some(collector.into_items()),
            request_counts,
        })
    }
}

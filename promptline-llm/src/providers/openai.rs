//! OpenAI adapter: chat completions, the Responses API for web search, and
//! the file-based Batch API.

use async_trait::async_trait;
use promptline_core::{
    BatchItemCollector, BatchMetadata, BatchRequest, BatchStatus, Capability, ChunkStream,
    ItemStatus, LlmConfig, OpenAiConfig, PromptlineError, Provider, ProviderBatchItem,
    ProviderBatchResult, ProviderResponse, RequestCounts, Result, TokenUsage, Value, OPENAI,
};
use reqwest::{multipart, Client, StatusCode};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;

use crate::http::{
    build_http_client, join_url, merge_options, parse_jsonl, read_json, read_text,
    resolve_api_key, transport_error,
};
use crate::openai_compatible::{
    bearer, chat_body, chat_response, stream_chat, ChatCompletionResponse, ChatParams,
    CHAT_COMPLETIONS_PATH,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const RESPONSES_PATH: &str = "/v1/responses";
const FILES_PATH: &str = "/v1/files";
const BATCHES_PATH: &str = "/v1/batches";
const API_KEY_ENV: &[&str] = &["OPENAI_API_KEY"];

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: Option<String>,
}

impl OpenAiClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_http_client(OPENAI)?,
            base_url: None,
        })
    }

    /// Overrides the base URL for every call; `baseUrl` in the config wins.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn url(&self, config: &OpenAiConfig, path: &str) -> String {
        let base = config
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .unwrap_or(OPENAI_BASE_URL);
        join_url(base, path)
    }

    fn api_key(config: &OpenAiConfig) -> Result<SecretString> {
        resolve_api_key(OPENAI, config.api_key.as_ref(), API_KEY_ENV)
    }

    fn authorized(
        &self,
        request: reqwest::RequestBuilder,
        config: &OpenAiConfig,
        api_key: &SecretString,
    ) -> reqwest::RequestBuilder {
        let request = bearer(request, Some(api_key));
        match &config.organization {
            Some(org) => request.header("OpenAI-Organization", org),
            None => request,
        }
    }

    fn params(config: &OpenAiConfig) -> ChatParams {
        ChatParams {
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            presence_penalty: config.presence_penalty,
            reasoning_effort: config.reasoning_effort.clone(),
        }
    }

    async fn invoke_chat(
        &self,
        prompt: &str,
        config: &LlmConfig,
        openai: &OpenAiConfig,
        api_key: &SecretString,
    ) -> Result<ProviderResponse> {
        let body = chat_body(prompt, config, Self::params(openai), false)?;
        let url = self.url(openai, CHAT_COMPLETIONS_PATH);
        tracing::debug!(provider = OPENAI, url = %url, "sending chat completion");

        let response = self
            .authorized(self.http.post(&url), openai, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;
        let raw: Value = read_json(OPENAI, response).await?;
        let parsed: ChatCompletionResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            PromptlineError::provider(OPENAI, format!("unexpected response: {err}"))
        })?;
        chat_response(OPENAI, parsed, raw)
    }

    /// Web search goes through the Responses API. Deployments that do not
    /// expose it answer 404, in which case the call is retried once as a
    /// plain chat completion without the search tool.
    async fn invoke_responses(
        &self,
        prompt: &str,
        config: &LlmConfig,
        openai: &OpenAiConfig,
        api_key: &SecretString,
    ) -> Result<ProviderResponse> {
        let body = responses_body(prompt, openai);
        let url = self.url(openai, RESPONSES_PATH);
        tracing::debug!(provider = OPENAI, url = %url, "sending responses request");

        let response = self
            .authorized(self.http.post(&url), openai, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::warn!(
                provider = OPENAI,
                model = %openai.common.model,
                "responses API unavailable, falling back to chat completions without web search"
            );
            return self.invoke_chat(prompt, config, openai, api_key).await;
        }

        let raw: Value = read_json(OPENAI, response).await?;
        let parsed: ResponsesResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            PromptlineError::provider(OPENAI, format!("unexpected response: {err}"))
        })?;
        Ok(parsed.into_provider_response(raw))
    }

    fn openai_config<'a>(config: &'a LlmConfig) -> Result<&'a OpenAiConfig> {
        match config {
            LlmConfig::OpenAi(openai) => Ok(openai),
            other => Err(PromptlineError::InvalidConfig(format!(
                "openai adapter received config for provider '{}'",
                other.provider()
            ))),
        }
    }

    async fn upload_batch_file(
        &self,
        openai: &OpenAiConfig,
        api_key: &SecretString,
        jsonl: String,
    ) -> Result<String> {
        let part = multipart::Part::bytes(jsonl.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|err| transport_error(OPENAI, err))?;
        let form = multipart::Form::new().text("purpose", "batch").part("file", part);

        let response = self
            .authorized(self.http.post(self.url(openai, FILES_PATH)), openai, api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;
        let file: FileObject = read_json(OPENAI, response).await?;
        Ok(file.id)
    }

    async fn download_file(
        &self,
        openai: &OpenAiConfig,
        api_key: &SecretString,
        file_id: &str,
    ) -> Result<String> {
        let path = format!("{FILES_PATH}/{file_id}/content");
        let response = self
            .authorized(self.http.get(self.url(openai, &path)), openai, api_key)
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;
        read_text(OPENAI, response).await
    }
}

fn responses_body(prompt: &str, openai: &OpenAiConfig) -> Value {
    let common = &openai.common;
    let mut body = json!({
        "model": common.model,
        "input": prompt,
    });
    if let Value::Object(map) = &mut body {
        if openai.web_search {
            map.insert("tools".into(), json!([{ "type": "web_search_preview" }]));
        }
        if let Some(temperature) = common.temperature {
            map.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = common.max_tokens {
            map.insert("max_output_tokens".into(), json!(max_tokens));
        }
        if let Some(top_p) = openai.top_p {
            map.insert("top_p".into(), json!(top_p));
        }
        if let Some(effort) = &openai.reasoning_effort {
            map.insert("reasoning".into(), json!({ "effort": effort }));
        }
    }
    merge_options(&mut body, &common.options);
    body
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<ResponsesContent>,
    #[serde(default)]
    summary: Vec<ResponsesContent>,
}

#[derive(Debug, Deserialize)]
struct ResponsesContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    output_tokens_details: Option<ResponsesOutputDetails>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

impl ResponsesResponse {
    fn into_provider_response(self, raw: Value) -> ProviderResponse {
        let mut content = String::new();
        let mut thinking = String::new();
        let mut search_calls = 0u64;

        for item in self.output {
            match item.kind.as_str() {
                "message" => {
                    for part in item.content {
                        content.push_str(part.text.as_deref().unwrap_or_default());
                    }
                }
                "reasoning" => {
                    for part in item.summary {
                        thinking.push_str(part.text.as_deref().unwrap_or_default());
                    }
                }
                "web_search_call" => search_calls += 1,
                _ => {}
            }
        }

        let mut usage = self
            .usage
            .map(|usage| TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                thinking_tokens: usage
                    .output_tokens_details
                    .and_then(|details| details.reasoning_tokens),
                ..TokenUsage::default()
            })
            .unwrap_or_default();
        usage.search_calls = Some(search_calls);

        ProviderResponse {
            content,
            thinking: (!thinking.is_empty()).then_some(thinking),
            usage,
            raw,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    request_counts: Option<BatchRequestCounts>,
}

#[derive(Debug, Deserialize)]
struct BatchRequestCounts {
    total: usize,
    completed: usize,
    failed: usize,
}

/// One line of a batch output or error file.
#[derive(Debug, Deserialize)]
struct BatchResultLine {
    custom_id: String,
    #[serde(default)]
    response: Option<BatchResultResponse>,
    #[serde(default)]
    error: Option<BatchResultError>,
}

#[derive(Debug, Deserialize)]
struct BatchResultResponse {
    status_code: u16,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Deserialize)]
struct BatchResultError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub(crate) fn map_batch_status(status: &str) -> BatchStatus {
    match status {
        "validating" => BatchStatus::Validating,
        "in_progress" => BatchStatus::InProgress,
        "finalizing" => BatchStatus::Finalizing,
        "completed" => BatchStatus::Completed,
        "failed" => BatchStatus::Failed,
        "expired" => BatchStatus::Expired,
        "cancelling" => BatchStatus::Cancelling,
        "cancelled" => BatchStatus::Cancelled,
        other => {
            tracing::warn!(provider = OPENAI, status = other, "unknown batch status");
            BatchStatus::InProgress
        }
    }
}

fn decode_result_line(line: BatchResultLine) -> ProviderBatchItem {
    if let Some(error) = line.error {
        let status = match error.code.as_deref() {
            Some("batch_expired") => ItemStatus::Expired,
            Some("batch_cancelled") => ItemStatus::Cancelled,
            _ => ItemStatus::Failed,
        };
        let message = error
            .message
            .or(error.code)
            .unwrap_or_else(|| "request failed".to_string());
        return ProviderBatchItem::failure(line.custom_id, status, message);
    }

    let Some(response) = line.response else {
        return ProviderBatchItem::failure(line.custom_id, ItemStatus::Failed, "empty result");
    };

    if !(200..300).contains(&response.status_code) {
        let message = response
            .body
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", response.status_code));
        return ProviderBatchItem::failure(line.custom_id, ItemStatus::Failed, message);
    }

    match serde_json::from_value::<ChatCompletionResponse>(response.body) {
        Ok(parsed) => {
            let usage = parsed.usage.as_ref().map(|usage| usage.to_token_usage());
            match parsed.choices.into_iter().next() {
                Some(choice) => ProviderBatchItem::success(
                    line.custom_id,
                    choice.message.content.unwrap_or_default(),
                    usage,
                ),
                None => {
                    ProviderBatchItem::failure(line.custom_id, ItemStatus::Failed, "no choices")
                }
            }
        }
        Err(err) => ProviderBatchItem::failure(
            line.custom_id,
            ItemStatus::Failed,
            format!("unexpected response body: {err}"),
        ),
    }
}

#[async_trait]
impl Provider for OpenAiClient {
    fn name(&self) -> &str {
        OPENAI
    }

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse> {
        let openai = Self::openai_config(config)?;
        let api_key = Self::api_key(openai)?;
        if openai.web_search {
            self.invoke_responses(prompt, config, openai, &api_key).await
        } else {
            self.invoke_chat(prompt, config, openai, &api_key).await
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Web search is only reachable through the Responses API, which this
    /// adapter does not stream; such configs are rejected up front.
    fn invoke_stream(&self, prompt: &str, config: &LlmConfig) -> Result<ChunkStream> {
        let openai = Self::openai_config(config)?;
        if openai.web_search {
            return Err(PromptlineError::capability(OPENAI, Capability::Streaming));
        }
        let api_key = Self::api_key(openai)?;
        let body = chat_body(prompt, config, Self::params(openai), true)?;
        let request = self
            .authorized(
                self.http.post(self.url(openai, CHAT_COMPLETIONS_PATH)),
                openai,
                &api_key,
            )
            .json(&body);
        Ok(stream_chat(OPENAI.to_string(), request))
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn create_batch(
        &self,
        requests: Vec<BatchRequest>,
        config: &LlmConfig,
    ) -> Result<BatchMetadata> {
        let openai = Self::openai_config(config)?;
        // Batch lines target chat completions, which has no search tool.
        if openai.web_search {
            return Err(PromptlineError::capability(OPENAI, Capability::Batch));
        }
        let api_key = Self::api_key(openai)?;

        let mut jsonl = String::new();
        for request in &requests {
            let line = json!({
                "custom_id": request.custom_id,
                "method": "POST",
                "url": CHAT_COMPLETIONS_PATH,
                "body": chat_body(&request.prompt, config, Self::params(openai), false)?,
            });
            jsonl.push_str(&serde_json::to_string(&line)?);
            jsonl.push('\n');
        }

        let input_file_id = self.upload_batch_file(openai, &api_key, jsonl).await?;
        let response = self
            .authorized(self.http.post(self.url(openai, BATCHES_PATH)), openai, &api_key)
            .json(&json!({
                "input_file_id": input_file_id,
                "endpoint": CHAT_COMPLETIONS_PATH,
                "completion_window": "24h",
            }))
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;
        let batch: BatchObject = read_json(OPENAI, response).await?;

        Ok(BatchMetadata::new(
            batch.id,
            OPENAI,
            openai.common.model.clone(),
            requests.len(),
        ))
    }

    async fn retrieve_batch(
        &self,
        metadata: &BatchMetadata,
        config: &LlmConfig,
    ) -> Result<ProviderBatchResult> {
        let openai = Self::openai_config(config)?;
        let api_key = Self::api_key(openai)?;

        let path = format!("{BATCHES_PATH}/{}", metadata.batch_id);
        let response = self
            .authorized(self.http.get(self.url(openai, &path)), openai, &api_key)
            .send()
            .await
            .map_err(|err| transport_error(OPENAI, err))?;
        let batch: BatchObject = read_json(OPENAI, response).await?;

        let status = map_batch_status(&batch.status);
        let request_counts = batch.request_counts.map(|counts| RequestCounts {
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
            ..RequestCounts::default()
        });

        if status != BatchStatus::Completed {
            return Ok(ProviderBatchResult {
                status,
                results: None,
                request_counts,
            });
        }

        let mut collector = BatchItemCollector::new();
        for file_id in [&batch.output_file_id, &batch.error_file_id]
            .into_iter()
            .flatten()
        {
            let body = self.download_file(openai, &api_key, file_id).await?;
            for line in parse_jsonl::<BatchResultLine>(OPENAI, &body)? {
                collector.insert(decode_result_line(line));
            }
        }
        tracing::debug!(
            provider = OPENAI,
            batch_id = %metadata.batch_id,
            items = collector.len(),
            expected = metadata.request_count,
            "decoded batch results"
        );

        Ok(ProviderBatchResult {
            status,
            results: Some(collector.into_items()),
            request_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_native_status_maps_to_itself() {
        for status in [
            "validating",
            "in_progress",
            "finalizing",
            "completed",
            "failed",
            "expired",
            "cancelling",
            "cancelled",
        ] {
            assert_eq!(map_batch_status(status).as_str(), status);
        }
        assert_eq!(map_batch_status("paused"), BatchStatus::InProgress);
    }

    #[test]
    fn expired_error_lines_become_expired_items() {
        let line: BatchResultLine = serde_json::from_str(
            r#"{"custom_id":"req-4","response":null,"error":{"code":"batch_expired","message":"expired"}}"#,
        )
        .unwrap();
        let item = decode_result_line(line);
        assert_eq!(item.status, ItemStatus::Expired);
        assert_eq!(item.error.as_deref(), Some("expired"));
    }

    #[test]
    fn non_2xx_responses_become_failures() {
        let line: BatchResultLine = serde_json::from_str(
            r#"{"custom_id":"req-1","response":{"status_code":400,"body":{"error":{"message":"bad request"}}},"error":null}"#,
        )
        .unwrap();
        let item = decode_result_line(line);
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("bad request"));
    }
}

//! Google Gemini API adapter

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use promptline_core::{
    BatchItemCollector, BatchMetadata, BatchRequest, BatchStatus, ChunkStream, GoogleConfig,
    ItemStatus, LlmConfig, PromptlineError, Provider, ProviderBatchItem, ProviderBatchResult,
    ProviderResponse, RequestCounts, Result, TokenUsage, Value, GOOGLE,
};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};

use crate::http::{
    build_http_client, ensure_success, join_url, read_json, resolve_api_key, transport_error,
};
use crate::stream::{normalize, Framing, UsageAccumulator};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_KEY_ENV: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Clone)]
pub struct GoogleClient {
    http: Client,
    base_url: Option<String>,
}

impl GoogleClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: build_http_client(GOOGLE)?,
            base_url: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn google_config(config: &LlmConfig) -> Result<&GoogleConfig> {
        match config {
            LlmConfig::Google(google) => Ok(google),
            other => Err(PromptlineError::InvalidConfig(format!(
                "google adapter received config for provider '{}'",
                other.provider()
            ))),
        }
    }

    fn url(&self, config: &GoogleConfig, path: &str) -> String {
        let base = config
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .unwrap_or(GEMINI_BASE_URL);
        join_url(base, path)
    }

    fn model_url(&self, config: &GoogleConfig, method: &str) -> String {
        let path = format!("/v1beta/models/{}:{method}", model_name(&config.common.model));
        self.url(config, &path)
    }

    /// The key travels in a header so it never becomes part of a URL that
    /// reqwest could echo back in an error.
    fn keyed(request: RequestBuilder, api_key: &SecretString) -> RequestBuilder {
        request.header(API_KEY_HEADER, api_key.expose_secret().as_str())
    }

    fn api_key(config: &GoogleConfig) -> Result<SecretString> {
        resolve_api_key(GOOGLE, config.api_key.as_ref(), API_KEY_ENV)
    }
}

fn model_name(model: &str) -> &str {
    let model = model.trim();
    model.strip_prefix("models/").unwrap_or(model)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    include_thoughts: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    web_search_queries: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: Option<u64>,
}

fn is_blocked_finish_reason(reason: &str) -> bool {
    matches!(
        reason,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
    )
}

/// Unknown keys in `options` land in `generationConfig`, which is where
/// Gemini expects sampling knobs such as `stopSequences`.
fn build_request(prompt: &str, config: &GoogleConfig) -> GenerateContentRequest {
    let common = &config.common;
    let thinking_config = (config.thinking_budget.is_some() || config.include_thoughts).then(|| {
        ThinkingConfig {
            thinking_budget: config.thinking_budget,
            include_thoughts: config.include_thoughts,
        }
    });
    let generation_config = GenerationConfig {
        temperature: common.temperature,
        max_output_tokens: common.max_tokens,
        top_p: config.top_p,
        top_k: config.top_k,
        thinking_config,
        extra: common.options.clone(),
    };

    GenerateContentRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(prompt.to_string()),
                thought: false,
            }],
        }],
        generation_config: Some(generation_config),
        tools: config
            .google_search
            .then(|| vec![json!({ "googleSearch": {} })]),
    }
}

fn usage_from_metadata(metadata: &UsageMetadata) -> TokenUsage {
    TokenUsage {
        input_tokens: metadata.prompt_token_count,
        output_tokens: metadata.candidates_token_count,
        thinking_tokens: metadata.thoughts_token_count,
        ..TokenUsage::default()
    }
}

struct DecodedResponse {
    content: String,
    thinking: Option<String>,
    usage: TokenUsage,
}

fn decode_response(
    response: GenerateContentResponse,
    config: &GoogleConfig,
) -> Result<DecodedResponse> {
    let candidate = response
        .candidates
        .and_then(|candidates| candidates.into_iter().next())
        .ok_or_else(|| PromptlineError::provider(GOOGLE, "No candidates in response"))?;

    let mut content = String::new();
    let mut thinking = String::new();
    for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
        let Some(text) = part.text else { continue };
        if part.thought {
            thinking.push_str(&text);
        } else {
            content.push_str(&text);
        }
    }

    if content.is_empty() {
        if let Some(reason) = candidate
            .finish_reason
            .as_deref()
            .filter(|reason| is_blocked_finish_reason(reason))
        {
            return Err(PromptlineError::provider(
                GOOGLE,
                format!("Generation blocked: {reason}"),
            ));
        }
    }

    let mut usage = response
        .usage_metadata
        .as_ref()
        .map(usage_from_metadata)
        .unwrap_or_default();
    if config.google_search {
        usage.search_calls = Some(
            candidate
                .grounding_metadata
                .map(|grounding| grounding.web_search_queries.len() as u64)
                .unwrap_or(0),
        );
    }

    Ok(DecodedResponse {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        usage,
    })
}

/// Each SSE event carries a full `GenerateContentResponse`; usage metadata is
/// a running snapshot, so it overwrites.
fn stream_handler(
    config: &GoogleConfig,
) -> impl FnMut(&str, &mut UsageAccumulator) -> Result<Vec<String>> + Send + 'static {
    let google_search = config.google_search;
    let mut emitted = false;

    move |payload, usage| {
        let response: GenerateContentResponse =
            serde_json::from_str(payload).map_err(|err| PromptlineError::parse(payload, err))?;

        if let Some(metadata) = &response.usage_metadata {
            usage.set_input(metadata.prompt_token_count);
            usage.set_output(metadata.candidates_token_count);
            if let Some(thoughts) = metadata.thoughts_token_count {
                usage.set_thinking(thoughts);
            }
        }

        let mut texts = Vec::new();
        for candidate in response.candidates.into_iter().flatten().take(1) {
            if let Some(content) = candidate.content {
                texts.extend(
                    content
                        .parts
                        .into_iter()
                        .filter(|part| !part.thought)
                        .filter_map(|part| part.text),
                );
            }
            if google_search {
                if let Some(grounding) = candidate.grounding_metadata {
                    usage.set_search_calls(grounding.web_search_queries.len() as u64);
                }
            }
            if !emitted && texts.iter().all(String::is_empty) {
                if let Some(reason) = candidate
                    .finish_reason
                    .as_deref()
                    .filter(|reason| is_blocked_finish_reason(reason))
                {
                    return Err(PromptlineError::provider(
                        GOOGLE,
                        format!("Generation blocked: {reason}"),
                    ));
                }
            }
        }
        emitted |= texts.iter().any(|text| !text.is_empty());
        Ok(texts)
    }
}

#[derive(Debug, Deserialize)]
struct BatchOperation {
    name: String,
}

pub(crate) fn map_batch_state(state: &str) -> BatchStatus {
    let state = state
        .strip_prefix("BATCH_STATE_")
        .or_else(|| state.strip_prefix("JOB_STATE_"))
        .unwrap_or(state);
    match state {
        "PENDING" => BatchStatus::Validating,
        "RUNNING" => BatchStatus::InProgress,
        "SUCCEEDED" => BatchStatus::Completed,
        "FAILED" => BatchStatus::Failed,
        "CANCELLED" => BatchStatus::Cancelled,
        "EXPIRED" => BatchStatus::Expired,
        other => {
            tracing::warn!(provider = GOOGLE, state = other, "unknown batch state");
            BatchStatus::InProgress
        }
    }
}

/// The batch resource is returned either bare or wrapped in a long-running
/// operation (`metadata` while running, `response` once done).
fn batch_state(job: &Value) -> Option<&str> {
    ["/metadata/state", "/state", "/response/state"]
        .iter()
        .find_map(|pointer| job.pointer(pointer).and_then(Value::as_str))
}

fn inlined_responses(job: &Value) -> Vec<Value> {
    [
        "/response/inlinedResponses/inlinedResponses",
        "/response/output/inlinedResponses/inlinedResponses",
        "/metadata/output/inlinedResponses/inlinedResponses",
        "/output/inlinedResponses/inlinedResponses",
    ]
    .iter()
    .find_map(|pointer| job.pointer(pointer).and_then(Value::as_array))
    .cloned()
    .unwrap_or_default()
}

fn decode_inlined_response(entry: Value, config: &GoogleConfig) -> Option<ProviderBatchItem> {
    let custom_id = entry
        .pointer("/metadata/key")
        .or_else(|| entry.get("key"))
        .and_then(Value::as_str)?
        .to_string();

    if let Some(error) = entry.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(ProviderBatchItem::failure(custom_id, ItemStatus::Failed, message));
    }

    let Some(response) = entry.get("response").cloned() else {
        return Some(ProviderBatchItem::failure(
            custom_id,
            ItemStatus::Failed,
            "empty result",
        ));
    };
    let item = serde_json::from_value::<GenerateContentResponse>(response)
        .map_err(|err| PromptlineError::provider(GOOGLE, format!("unexpected response: {err}")))
        .and_then(|response| decode_response(response, config));
    Some(match item {
        Ok(decoded) => ProviderBatchItem::success(custom_id, decoded.content, Some(decoded.usage)),
        Err(err) => ProviderBatchItem::failure(custom_id, ItemStatus::Failed, err.to_string()),
    })
}

fn batch_counts(job: &Value) -> Option<RequestCounts> {
    let stats = ["/metadata/batchStats", "/batchStats", "/response/batchStats"]
        .iter()
        .find_map(|pointer| job.pointer(pointer))?;
    // Stats are int64 and therefore arrive as JSON strings.
    let count = |key: &str| -> usize {
        match stats.get(key) {
            Some(Value::String(raw)) => raw.parse().unwrap_or(0),
            Some(Value::Number(number)) => number.as_u64().unwrap_or(0) as usize,
            _ => 0,
        }
    };
    Some(RequestCounts {
        total: count("requestCount"),
        completed: count("successfulRequestCount"),
        failed: count("failedRequestCount"),
        ..RequestCounts::default()
    })
}

#[async_trait]
impl Provider for GoogleClient {
    fn name(&self) -> &str {
        GOOGLE
    }

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse> {
        let google = Self::google_config(config)?;
        let api_key = Self::api_key(google)?;
        let request = build_request(prompt, google);

        let response = Self::keyed(
            self.http.post(self.model_url(google, "generateContent")),
            &api_key,
        )
        .json(&request)
        .send()
        .await
        .map_err(|err| transport_error(GOOGLE, err))?;
        let raw: Value = read_json(GOOGLE, response).await?;
        let parsed: GenerateContentResponse =
            serde_json::from_value(raw.clone()).map_err(|err| {
                PromptlineError::provider(GOOGLE, format!("unexpected response: {err}"))
            })?;
        let decoded = decode_response(parsed, google)?;

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
        let google = Self::google_config(config)?;
        let api_key = Self::api_key(google)?;
        let request = Self::keyed(
            self.http
                .post(self.model_url(google, "streamGenerateContent"))
                .query(&[("alt", "sse")]),
            &api_key,
        )
        .json(&build_request(prompt, google));
        let handler = stream_handler(google);

        Ok(stream::once(async move {
            let response = request
                .send()
                .await
                .map_err(|err| transport_error(GOOGLE, err))?;
            let response = ensure_success(GOOGLE, response).await?;
            Ok::<_, PromptlineError>(normalize(
                GOOGLE.to_string(),
                response.bytes_stream(),
                Framing::Sse,
                handler,
            ))
        })
        .flat_map(|result| match result {
            Ok(stream) => stream,
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
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
        let google = Self::google_config(config)?;
        let api_key = Self::api_key(google)?;

        let mut inlined = Vec::with_capacity(requests.len());
        for request in &requests {
            inlined.push(json!({
                "request": serde_json::to_value(build_request(&request.prompt, google))?,
                "metadata": { "key": request.custom_id },
            }));
        }
        let body = json!({
            "batch": {
                "displayName": format!("promptline-{}", model_name(&google.common.model)),
                "inputConfig": { "requests": { "requests": inlined } },
            }
        });

        let response = Self::keyed(
            self.http.post(self.model_url(google, "batchGenerateContent")),
            &api_key,
        )
        .json(&body)
        .send()
        .await
        .map_err(|err| transport_error(GOOGLE, err))?;
        let operation: BatchOperation = read_json(GOOGLE, response).await?;

        Ok(BatchMetadata::new(
            operation.name,
            GOOGLE,
            google.common.model.clone(),
            requests.len(),
        ))
    }

    async fn retrieve_batch(
        &self,
        metadata: &BatchMetadata,
        config: &LlmConfig,
    ) -> Result<ProviderBatchResult> {
        let google = Self::google_config(config)?;
        let api_key = Self::api_key(google)?;

        let name = if metadata.batch_id.starts_with("batches/") {
            metadata.batch_id.clone()
        } else {
            format!("batches/{}", metadata.batch_id)
        };
        let response = Self::keyed(
            self.http.get(self.url(google, &format!("/v1beta/{name}"))),
            &api_key,
        )
        .send()
        .await
        .map_err(|err| transport_error(GOOGLE, err))?;
        let job: Value = read_json(GOOGLE, response).await?;

        let status = batch_state(&job)
            .map(map_batch_state)
            .unwrap_or(BatchStatus::InProgress);
        let request_counts = batch_counts(&job);
        if status != BatchStatus::Completed {
            return Ok(ProviderBatchResult {
                status,
                results: None,
                request_counts,
            });
        }

        let mut collector = BatchItemCollector::new();
        for entry in inlined_responses(&job) {
            if let Some(item) = decode_inlined_response(entry, google) {
                collector.insert(item);
            }
        }

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
    fn strips_models_prefix() {
        assert_eq!(model_name("models/gemini-2.5-flash"), "gemini-2.5-flash");
        assert_eq!(model_name(" gemini-2.5-pro "), "gemini-2.5-pro");
    }

    #[test]
    fn maps_batch_and_job_state_prefixes() {
        assert_eq!(map_batch_state("BATCH_STATE_PENDING"), BatchStatus::Validating);
        assert_eq!(map_batch_state("JOB_STATE_RUNNING"), BatchStatus::InProgress);
        assert_eq!(map_batch_state("BATCH_STATE_SUCCEEDED"), BatchStatus::Completed);
        assert_eq!(map_batch_state("JOB_STATE_FAILED"), BatchStatus::Failed);
        assert_eq!(map_batch_state("BATCH_STATE_CANCELLED"), BatchStatus::Cancelled);
        assert_eq!(map_batch_state("BATCH_STATE_EXPIRED"), BatchStatus::Expired);
        assert_eq!(map_batch_state("BATCH_STATE_PAUSED"), BatchStatus::InProgress);
    }

    #[test]
    fn thought_parts_are_split_from_content() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "text": "planning", "thought": true },
                    { "text": "Paris" }
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 7,
                "candidatesTokenCount": 1,
                "thoughtsTokenCount": 12
            }
        }))
        .unwrap();

        let decoded = decode_response(response, &GoogleConfig::default()).unwrap();
        assert_eq!(decoded.content, "Paris");
        assert_eq!(decoded.thinking.as_deref(), Some("planning"));
        assert_eq!(decoded.usage, TokenUsage::new(7, 1).with_thinking_tokens(12));
    }

    #[test]
    fn blocked_response_is_a_provider_error() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{ "finishReason": "SAFETY" }]
        }))
        .unwrap();
        let err = decode_response(response, &GoogleConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, PromptlineError::Provider { .. }));
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn request_puts_sampling_and_thinking_in_generation_config() {
        let mut config = GoogleConfig {
            top_k: Some(40),
            thinking_budget: Some(-1),
            include_thoughts: true,
            google_search: true,
            ..GoogleConfig::default()
        };
        config.common.max_tokens = Some(256);
        config
            .common
            .options
            .insert("stopSequences".into(), json!(["END"]));

        let body = serde_json::to_value(build_request("hi", &config)).unwrap();
        let generation = &body["generationConfig"];
        assert_eq!(generation["maxOutputTokens"], 256);
        assert_eq!(generation["topK"], 40);
        assert_eq!(generation["thinkingConfig"]["thinkingBudget"], -1);
        assert_eq!(generation["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(generation["stopSequences"], json!(["END"]));
        assert_eq!(body["tools"][0], json!({ "googleSearch": {} }));
    }
}

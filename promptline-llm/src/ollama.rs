use futures::stream::{self, StreamExt};
use promptline_core::{
    ChunkStream, LlmConfig, OllamaConfig, PromptlineError, Provider, ProviderResponse, Result,
    TokenUsage, Value, OLLAMA,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::http::{build_http_client, ensure_success, join_url, read_json, transport_error};
use crate::stream::{normalize, Framing, UsageAccumulator};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Local Ollama server. No credentials and no batch jobs.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: Option<String>,
    http: Client,
}

impl OllamaClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            base_url: None,
            http: build_http_client(OLLAMA)?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn ollama_config(config: &LlmConfig) -> Result<&OllamaConfig> {
        match config {
            LlmConfig::Ollama(ollama) => Ok(ollama),
            other => Err(PromptlineError::InvalidConfig(format!(
                "ollama adapter received config for provider '{}'",
                other.provider()
            ))),
        }
    }

    fn chat_url(&self, config: &OllamaConfig) -> String {
        let base = config
            .base_url
            .as_deref()
            .or(self.base_url.as_deref())
            .unwrap_or(OLLAMA_BASE_URL);
        join_url(base, "/api/chat")
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    options: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Sampling parameters go under `options`, as do entries from the free-form
/// bag, which may override them.
fn build_request<'a>(prompt: &str, config: &'a OllamaConfig, stream: bool) -> OllamaChatRequest<'a> {
    let common = &config.common;
    let mut options = Map::new();
    let mut set = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            options.insert(key.to_string(), value);
        }
    };
    set("temperature", common.temperature.map(Value::from));
    set("num_predict", common.max_tokens.map(Value::from));
    set("top_p", config.top_p.map(Value::from));
    set("top_k", config.top_k.map(Value::from));
    set("num_ctx", config.num_ctx.map(Value::from));
    for (key, value) in &common.options {
        options.insert(key.clone(), value.clone());
    }

    OllamaChatRequest {
        model: &common.model,
        messages: vec![OllamaMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
            thinking: None,
        }],
        stream,
        options,
        keep_alive: config.keep_alive.as_deref(),
    }
}

fn usage_of(response: &OllamaChatResponse) -> TokenUsage {
    TokenUsage::new(
        response.prompt_eval_count.unwrap_or(0),
        response.eval_count.unwrap_or(0),
    )
}

/// One NDJSON line. Counts arrive only on the `done` line.
fn stream_event(payload: &str, usage: &mut UsageAccumulator) -> Result<Vec<String>> {
    let chunk: OllamaChatResponse =
        serde_json::from_str(payload).map_err(|err| PromptlineError::parse(payload, err))?;
    if let Some(error) = chunk.error {
        return Err(PromptlineError::provider(OLLAMA, error));
    }
    if chunk.done {
        usage.set_input(chunk.prompt_eval_count.unwrap_or(0));
        usage.set_output(chunk.eval_count.unwrap_or(0));
    }
    Ok(chunk
        .message
        .map(|message| vec![message.content])
        .unwrap_or_default())
}

#[async_trait::async_trait]
impl Provider for OllamaClient {
    fn name(&self) -> &str {
        OLLAMA
    }

    async fn invoke(&self, prompt: &str, config: &LlmConfig) -> Result<ProviderResponse> {
        let ollama = Self::ollama_config(config)?;
        let request = build_request(prompt, ollama, false);

        let response = self
            .http
            .post(self.chat_url(ollama))
            .json(&request)
            .send()
            .await
            .map_err(|err| transport_error(OLLAMA, err))?;
        let raw: Value = read_json(OLLAMA, response).await?;
        let response: OllamaChatResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            PromptlineError::provider(OLLAMA, format!("unexpected response: {err}"))
        })?;
        if let Some(error) = response.error {
            return Err(PromptlineError::provider(OLLAMA, error));
        }

        let usage = usage_of(&response);
        let message = response.message.unwrap_or(OllamaMessage {
            role: String::new(),
            content: String::new(),
            thinking: None,
        });
        Ok(ProviderResponse {
            content: message.content,
            thinking: message.thinking.filter(|thinking| !thinking.is_empty()),
            usage,
            raw,
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn invoke_stream(&self, prompt: &str, config: &LlmConfig) -> Result<ChunkStream> {
        let ollama = Self::ollama_config(config)?;
        let request = self
            .http
            .post(self.chat_url(ollama))
            .json(&build_request(prompt, ollama, true));

        Ok(stream::once(async move {
            let response = request
                .send()
                .await
                .map_err(|err| transport_error(OLLAMA, err))?;
            let response = ensure_success(OLLAMA, response).await?;
            Ok::<_, PromptlineError>(normalize(
                OLLAMA.to_string(),
                response.bytes_stream(),
                Framing::JsonLines,
                stream_event,
            ))
        })
        .flat_map(|result| match result {
            Ok(stream) => stream,
            Err(err) => stream::iter(vec![Err(err)]).boxed(),
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sampling_parameters_are_nested_under_options() {
        let mut config = OllamaConfig {
            top_k: Some(20),
            num_ctx: Some(8192),
            keep_alive: Some("5m".to_string()),
            ..OllamaConfig::default()
        };
        config.common.model = "llama3.1".to_string();
        config.common.max_tokens = Some(128);
        config.common.options.insert("seed".into(), json!(7));

        let body = serde_json::to_value(build_request("hi", &config, false)).unwrap();
        assert_eq!(body["model"], "llama3.1");
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["top_k"], 20);
        assert_eq!(body["options"]["num_ctx"], 8192);
        assert_eq!(body["options"]["seed"], 7);
        assert_eq!(body["keep_alive"], "5m");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn done_line_reports_counts() {
        let mut usage = UsageAccumulator::new();
        let texts = stream_event(
            r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#,
            &mut usage,
        )
        .unwrap();
        assert_eq!(texts, vec!["Hi".to_string()]);

        stream_event(
            r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":9,"eval_count":3}"#,
            &mut usage,
        )
        .unwrap();
        assert_eq!(usage.finish(), TokenUsage::new(9, 3));
    }

    #[test]
    fn error_lines_fail_the_stream() {
        let mut usage = UsageAccumulator::new();
        let err = stream_event(r#"{"error":"model not found"}"#, &mut usage).unwrap_err();
        assert!(err.to_string().contains("model not found"));
    }
}

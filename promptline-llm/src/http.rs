//! Plumbing shared by the HTTP adapters.

use std::time::Duration;

use promptline_core::{PromptlineError, Result, Value};
use reqwest::{Client, Response, StatusCode};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::Map;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) fn build_http_client(provider: &str) -> Result<Client> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|err| PromptlineError::provider(provider, err))
}

/// Explicit key first, then the first environment variable that is set.
pub(crate) fn resolve_api_key(
    provider: &str,
    explicit: Option<&SecretString>,
    env_vars: &[&str],
) -> Result<SecretString> {
    if let Some(key) = explicit {
        return Ok(key.clone());
    }
    env_vars
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|value| !value.is_empty()))
        .map(SecretString::new)
        .ok_or_else(|| PromptlineError::config(provider, "apiKey"))
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Merges the free-form `options` bag into a request body, overriding.
pub(crate) fn merge_options(body: &mut Value, options: &Map<String, Value>) {
    if let Value::Object(map) = body {
        for (key, value) in options {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// Pulls a human-readable message out of a vendor error body.
///
/// Understands `{"error": {"message": ..}}`, `{"error": ".."}` and
/// `{"message": ..}`; anything else is reported with the raw body.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("error").filter(|error| error.is_string()))
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    message.unwrap_or_else(|| format!("HTTP {}: {}", status, body))
}

pub(crate) async fn ensure_success(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PromptlineError::provider(provider, error_message(status, &body)))
}

pub(crate) async fn read_json<T: DeserializeOwned>(provider: &str, response: Response) -> Result<T> {
    ensure_success(provider, response)
        .await?
        .json::<T>()
        .await
        .map_err(|err| transport_error(provider, err))
}

pub(crate) async fn read_text(provider: &str, response: Response) -> Result<String> {
    ensure_success(provider, response)
        .await?
        .text()
        .await
        .map_err(|err| transport_error(provider, err))
}

/// Strips the request URL so query parameters never reach error messages.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> PromptlineError {
    PromptlineError::provider(provider, err.without_url())
}

/// Parses a JSON Lines body, skipping blank lines.
pub(crate) fn parse_jsonl<T: DeserializeOwned>(provider: &str, body: &str) -> Result<Vec<T>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|err| {
                PromptlineError::provider(provider, format!("malformed result line: {err}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_nested_and_flat_error_messages() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(
            error_message(status, r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message(status, r#"{"error":"model not found"}"#), "model not found");
        assert_eq!(error_message(status, "oops"), "HTTP 400 Bad Request: oops");
    }

    #[test]
    fn joins_urls_without_double_slashes() {
        assert_eq!(
            join_url("http://localhost:1234/", "/v1/files"),
            "http://localhost:1234/v1/files"
        );
    }
}

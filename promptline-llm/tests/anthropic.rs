#![cfg(feature = "anthropic")]

use futures::StreamExt;
use httpmock::prelude::*;
use promptline_core::{
    BatchMetadata, BatchRequest, BatchStatus, ItemStatus, LlmConfig, PromptlineError, Provider, StreamChunk,
    TokenUsage,
};
use promptline_llm::AnthropicClient;
use serde_json::json;

fn config(server: &MockServer, extra: serde_json::Value) -> LlmConfig {
    let mut value = json!({
        "provider": "anthropic",
        "model": "claude-sonnet-4-5",
        "apiKey": "ak-test",
        "baseUrl": server.url(""),
        "maxTokens": 1024,
    });
    if let (Some(map), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        map.extend(extra.clone());
    }
    LlmConfig::from_json(&value.to_string()).expect("config")
}

#[tokio::test]
async fn invoke_sends_version_header_and_maps_usage() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .header("x-api-key", "ak-test")
            .header("anthropic-version", "2023-06-01")
            .json_body_partial(r#"{"model":"claude-sonnet-4-5","max_tokens":1024}"#);
        then.status(200).json_body(json!({
            "id": "msg_1",
            "type": "message",
            "content": [{ "type": "text", "text": "Bonjour" }],
            "usage": { "input_tokens": 10, "output_tokens": 4 }
        }));
    });

    let client = AnthropicClient::new().expect("client");
    let response = client
        .invoke("Say hello in French", &config(&server, json!({})))
        .await
        .expect("invoke");

    assert_eq!(response.content, "Bonjour");
    assert_eq!(response.thinking, None);
    assert_eq!(response.usage, TokenUsage::new(10, 4));
    mock.assert();
}

#[tokio::test]
async fn missing_max_tokens_fails_before_any_request() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200).json_body(json!({ "content": [] }));
    });

    let mut config = config(&server, json!({}));
    config.common_mut().max_tokens = None;

    let client = AnthropicClient::new().expect("client");
    let err = client.invoke("hi", &config).await.unwrap_err();

    match err {
        PromptlineError::Config { provider, field } => {
            assert_eq!(provider, "anthropic");
            assert_eq!(field, "maxTokens");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mock.hits(), 0);
}

#[tokio::test]
async fn thinking_and_tool_usage_are_reported() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .header("anthropic-beta", "web-fetch-2025-09-10")
            .json_body_partial(r#"{"thinking":{"type":"enabled","budget_tokens":2000}}"#);
        then.status(200).json_body(json!({
            "content": [
                { "type": "thinking", "thinking": "Considering sources" },
                { "type": "server_tool_use", "id": "srv_1", "name": "web_search" },
                { "type": "text", "text": "Answer!!" }
            ],
            "usage": {
                "input_tokens": 50,
                "output_tokens": 40,
                "server_tool_use": { "web_search_requests": 2, "web_fetch_requests": 1 }
            }
        }));
    });

    let client = AnthropicClient::new().expect("client");
    let response = client
        .invoke(
            "research",
            &config(
                &server,
                json!({ "thinkingBudget": 2000, "webSearch": true, "webFetch": true }),
            ),
        )
        .await
        .expect("invoke");

    assert_eq!(response.content, "Answer!!");
    assert_eq!(response.thinking.as_deref(), Some("Considering sources"));
    assert_eq!(
        response.usage,
        TokenUsage::new(50, 40)
            .with_thinking_tokens(38)
            .with_search_calls(2)
            .with_fetch_calls(1)
    );
}

#[tokio::test]
async fn stream_emits_text_deltas_and_final_usage() {
    let server = MockServer::start();
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":6}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n"
    );
    server.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages")
            .json_body_partial(r#"{"stream":true}"#);
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(body);
    });

    let client = AnthropicClient::new().expect("client");
    let chunks: Vec<StreamChunk> = client
        .invoke_stream("hi", &config(&server, json!({})))
        .expect("stream")
        .map(|chunk| chunk.expect("chunk"))
        .collect()
        .await;

    assert_eq!(
        chunks,
        vec![
            StreamChunk::text("Hi"),
            StreamChunk::text(" there"),
            StreamChunk::terminal(TokenUsage::new(12, 6)),
        ]
    );
}

#[tokio::test]
async fn stream_error_event_ends_without_terminal_chunk() {
    let server = MockServer::start();
    let body = concat!(
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Par\"}}\n\n",
        "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n"
    );
    server.mock(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200).body(body);
    });

    let client = AnthropicClient::new().expect("client");
    let chunks: Vec<_> = client
        .invoke_stream("hi", &config(&server, json!({})))
        .expect("stream")
        .collect()
        .await;

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].as_ref().expect("text"), &StreamChunk::text("Par"));
    let err = chunks[1].as_ref().unwrap_err();
    assert!(err.to_string().contains("Overloaded"));
}

#[tokio::test]
async fn retrieve_ended_batch_reads_results_url() {
    let server = MockServer::start();
    let results_url = server.url("/v1/messages/batches/msgbatch_1/results");
    server.mock(move |when, then| {
        when.method(GET).path("/v1/messages/batches/msgbatch_1");
        then.status(200).json_body(json!({
            "id": "msgbatch_1",
            "processing_status": "ended",
            "request_counts": {
                "processing": 0, "succeeded": 1, "errored": 1, "canceled": 0, "expired": 1
            },
            "results_url": results_url
        }));
    });
    let lines = [
        json!({ "custom_id": "req-1", "result": { "type": "errored", "error": {
            "type": "error", "error": { "type": "invalid_request_error", "message": "prompt too long" }
        }}}),
        json!({ "custom_id": "req-0", "result": { "type": "succeeded", "message": {
            "content": [{ "type": "text", "text": "ok" }],
            "usage": { "input_tokens": 3, "output_tokens": 1 }
        }}}),
        json!({ "custom_id": "req-2", "result": { "type": "expired" } }),
    ]
    .iter()
    .map(|line| line.to_string())
    .collect::<Vec<_>>()
    .join("\n");
    let results = server.mock(move |when, then| {
        when.method(GET)
            .path("/v1/messages/batches/msgbatch_1/results")
            .header("x-api-key", "ak-test");
        then.status(200).body(lines);
    });

    let client = AnthropicClient::new().expect("client");
    let metadata = BatchMetadata::new("msgbatch_1", "anthropic", "claude-sonnet-4-5", 3);
    let result = client
        .retrieve_batch(&metadata, &config(&server, json!({})))
        .await
        .expect("retrieve");

    assert_eq!(result.status, BatchStatus::Completed);
    let counts = result.request_counts.expect("counts");
    assert_eq!((counts.total, counts.completed, counts.failed, counts.expired), (3, 1, 1, 1));

    let items = result.results.expect("results");
    let statuses: Vec<_> = items
        .iter()
        .map(|item| (item.custom_id.as_str(), item.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("req-1", ItemStatus::Failed),
            ("req-0", ItemStatus::Success),
            ("req-2", ItemStatus::Expired),
        ]
    );
    assert_eq!(items[0].error.as_deref(), Some("prompt too long"));
    results.assert();
}

#[tokio::test]
async fn canceling_batch_maps_to_cancelling() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v1/messages/batches/msgbatch_2");
        then.status(200)
            .json_body(json!({ "id": "msgbatch_2", "processing_status": "canceling" }));
    });

    let client = AnthropicClient::new().expect("client");
    let metadata = BatchMetadata::new("msgbatch_2", "anthropic", "claude-sonnet-4-5", 1);
    let result = client
        .retrieve_batch(&metadata, &config(&server, json!({})))
        .await
        .expect("retrieve");

    assert_eq!(result.status, BatchStatus::Cancelling);
    assert!(result.results.is_none());
}

#[tokio::test]
async fn create_batch_wraps_message_params_by_custom_id() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/messages/batches")
            .header("x-api-key", "ak-test")
            .json_body_partial(
                r#"{"requests":[
                    {"custom_id":"req-0","params":{"model":"claude-sonnet-4-5","max_tokens":1024}},
                    {"custom_id":"req-1","params":{"model":"claude-sonnet-4-5","max_tokens":1024}}
                ]}"#,
            );
        then.status(200).json_body(json!({
            "id": "msgbatch_new",
            "type": "message_batch",
            "processing_status": "in_progress"
        }));
    });

    let client = AnthropicClient::new().expect("client");
    let metadata = client
        .create_batch(
            vec![BatchRequest::new(0, "first"), BatchRequest::new(1, "second")],
            &config(&server, json!({})),
        )
        .await
        .expect("create");

    assert_eq!(metadata.batch_id, "msgbatch_new");
    assert_eq!(metadata.provider, "anthropic");
    assert_eq!(metadata.model, "claude-sonnet-4-5");
    assert_eq!(metadata.request_count, 2);
    mock.assert();
}

#[tokio::test]
async fn create_batch_requires_max_tokens_before_submitting() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/messages/batches");
        then.status(200).json_body(json!({ "id": "x", "processing_status": "in_progress" }));
    });

    let mut config = config(&server, json!({}));
    config.common_mut().max_tokens = None;

    let client = AnthropicClient::new().expect("client");
    let err = client
        .create_batch(vec![BatchRequest::new(0, "first")], &config)
        .await
        .unwrap_err();

    assert!(matches!(err, PromptlineError::Config { .. }));
    assert_eq!(mock.hits(), 0);
}

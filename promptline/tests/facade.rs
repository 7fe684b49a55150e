use promptline::prelude::*;
use promptline::{BatchMetadata, PromptTemplate, UsageTotals};
use serde::Serialize;

#[derive(Serialize)]
struct Review {
    product: String,
    stars: u8,
}

#[test]
fn template_renders_serialized_input() {
    let template = PromptTemplate::new("Summarize the {{stars}}-star review of {{product}}.");
    let review = Review {
        product: "kettle".to_string(),
        stars: 4,
    };

    let rendered = template
        .render(&serde_json::to_value(review).unwrap())
        .expect("render");
    assert_eq!(rendered, "Summarize the 4-star review of kettle.");
}

#[test]
fn config_round_trips_through_json() {
    let config = LlmConfig::from_json(
        r#"{"provider":"google","model":"gemini-2.5-flash","maxTokens":256,"googleSearch":true}"#,
    )
    .unwrap();
    assert_eq!(config.provider(), "google");

    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["maxTokens"], 256);
    assert_eq!(json["googleSearch"], true);
}

#[test]
fn batch_metadata_is_persistable() {
    let metadata = BatchMetadata::new("batch_1", "openai", "gpt-4o-mini", 2);
    let restored = BatchMetadata::from_json(&metadata.to_json().unwrap()).unwrap();
    assert_eq!(restored, metadata);
}

#[cfg(feature = "ollama")]
#[test]
fn node_builds_with_factory_selected_provider() {
    let node: Node<String, String> = Node::builder()
        .prompt_fn(|input: &String| input.clone())
        .parser(StrParser)
        .config(LlmConfig::ollama("llama3.1"))
        .build()
        .unwrap();

    assert_eq!(node.provider().name(), "ollama");
    assert_eq!(node.total_token_usage(), UsageTotals::default());
}

use promptline_core::{
    BatchItemCollector, BatchMetadata, BatchStatus, ItemStatus, ProviderBatchItem, TokenUsage,
};

#[test]
fn success_is_never_overwritten_by_a_later_failure() {
    let mut collector = BatchItemCollector::new();
    assert!(collector.insert(ProviderBatchItem::success(
        "req-0",
        "ok",
        Some(TokenUsage::new(1, 1))
    )));
    assert!(!collector.insert(ProviderBatchItem::failure(
        "req-0",
        ItemStatus::Failed,
        "late error"
    )));

    let items = collector.into_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].content.as_deref(), Some("ok"));
}

#[test]
fn failure_is_replaced_by_a_later_success() {
    let mut collector = BatchItemCollector::new();
    collector.insert(ProviderBatchItem::failure(
        "req-3",
        ItemStatus::Failed,
        "transient",
    ));
    assert!(collector.insert(ProviderBatchItem::success("req-3", "recovered", None)));

    let items = collector.into_items();
    assert_eq!(items[0].status, ItemStatus::Success);
    assert_eq!(items[0].content.as_deref(), Some("recovered"));
}

#[test]
fn first_failure_wins_over_later_failure() {
    let mut collector = BatchItemCollector::new();
    collector.insert(ProviderBatchItem::failure("req-1", ItemStatus::Expired, "first"));
    assert!(!collector.insert(ProviderBatchItem::failure(
        "req-1",
        ItemStatus::Failed,
        "second"
    )));

    let items = collector.into_items();
    assert_eq!(items[0].status, ItemStatus::Expired);
    assert_eq!(items[0].error.as_deref(), Some("first"));
}

#[test]
fn items_keep_first_seen_order() {
    let mut collector = BatchItemCollector::new();
    collector.insert(ProviderBatchItem::success("req-2", "c", None));
    collector.insert(ProviderBatchItem::success("req-0", "a", None));
    collector.insert(ProviderBatchItem::success("req-1", "b", None));

    let ids: Vec<_> = collector
        .into_items()
        .into_iter()
        .map(|item| item.custom_id)
        .collect();
    assert_eq!(ids, vec!["req-2", "req-0", "req-1"]);
}

#[test]
fn metadata_stands_alone_as_json() {
    let metadata = BatchMetadata::new("batch_abc", "openai", "gpt-4o-mini", 3);
    let json = metadata.to_json().unwrap();
    assert!(json.contains("\"batchId\":\"batch_abc\""));
    assert!(json.contains("\"requestCount\":3"));

    let restored = BatchMetadata::from_json(&json).unwrap();
    assert_eq!(restored, metadata);
}

#[test]
fn batch_status_uses_snake_case_on_the_wire() {
    assert_eq!(
        serde_json::to_string(&BatchStatus::InProgress).unwrap(),
        "\"in_progress\""
    );
    assert_eq!(
        serde_json::from_str::<BatchStatus>("\"cancelling\"").unwrap(),
        BatchStatus::Cancelling
    );
}

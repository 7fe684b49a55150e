use std::sync::Arc;

use async_trait::async_trait;
use promptline_core::{
    Executable, ExecutableExt, FnStage, PromptlineError, TokenUsage, UsageLedger, UsageRecord,
    UsageTotals,
};

/// A stage that records a fixed usage every time it runs.
struct Metered {
    suffix: &'static str,
    usage: TokenUsage,
    ledger: UsageLedger,
}

impl Metered {
    fn new(suffix: &'static str, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            suffix,
            usage: TokenUsage::new(input_tokens, output_tokens),
            ledger: UsageLedger::new(),
        }
    }
}

#[async_trait]
impl Executable<String, String> for Metered {
    async fn execute(&self, input: String) -> Result<String, PromptlineError> {
        self.ledger
            .append(UsageRecord::new("mock", "mock-1", self.usage.clone()));
        Ok(format!("{input}{}", self.suffix))
    }

    fn tracks_usage(&self) -> bool {
        true
    }

    fn usage_records(&self) -> Vec<UsageRecord> {
        self.ledger.records()
    }

    fn clear_usage_records(&self) {
        self.ledger.clear();
    }
}

struct Failing;

#[async_trait]
impl Executable<String, String> for Failing {
    async fn execute(&self, _input: String) -> Result<String, PromptlineError> {
        Err(PromptlineError::provider("mock", "boom"))
    }
}

#[tokio::test]
async fn pipeline_runs_stages_in_order() {
    let pipeline = Metered::new("-a", 1, 1).then(Metered::new("-b", 1, 1));
    let output = pipeline.execute("x".to_string()).await.unwrap();
    assert_eq!(output, "x-a-b");
}

#[tokio::test]
async fn pipeline_totals_equal_sum_of_stages() {
    let pipeline = Metered::new("-a", 10, 2).then(Metered::new("-b", 5, 3));
    pipeline.execute("x".to_string()).await.unwrap();

    assert_eq!(pipeline.usage_records().len(), 2);
    assert_eq!(
        pipeline.total_token_usage(),
        UsageTotals {
            input_tokens: 15,
            output_tokens: 5,
            total_tokens: 20,
        }
    );
}

#[tokio::test]
async fn nesting_does_not_change_aggregate_usage() {
    let left_nested = Metered::new("-a", 1, 2)
        .then(Metered::new("-b", 3, 4))
        .then(Metered::new("-c", 5, 6));
    let right_nested =
        Metered::new("-a", 1, 2).then(Metered::new("-b", 3, 4).then(Metered::new("-c", 5, 6)));

    let left_output = left_nested.execute("x".to_string()).await.unwrap();
    let right_output = right_nested.execute("x".to_string()).await.unwrap();

    assert_eq!(left_output, right_output);
    assert_eq!(left_nested.total_token_usage(), right_nested.total_token_usage());
    assert_eq!(left_nested.total_token_usage().total_tokens, 21);
}

#[tokio::test]
async fn non_tracking_stages_contribute_nothing() {
    let upper = FnStage::new(|input: String| async move {
        Ok::<_, PromptlineError>(input.to_uppercase())
    });
    let pipeline = Metered::new("-a", 4, 4).then(upper);

    let output = pipeline.execute("x".to_string()).await.unwrap();
    assert_eq!(output, "X-A");
    assert!(pipeline.tracks_usage());
    assert_eq!(pipeline.total_token_usage().total_tokens, 8);
}

#[tokio::test]
async fn tail_never_runs_after_head_failure() {
    let tail = Arc::new(Metered::new("-b", 1, 1));
    let pipeline = Failing.then(tail.clone());

    let err = pipeline.execute("x".to_string()).await.unwrap_err();
    assert!(matches!(err, PromptlineError::Provider { .. }));
    assert!(tail.usage_records().is_empty());
}

#[tokio::test]
async fn clearing_a_pipeline_clears_every_stage() {
    let head = Arc::new(Metered::new("-a", 1, 1));
    let pipeline = head.clone().then(Metered::new("-b", 1, 1));
    pipeline.execute("x".to_string()).await.unwrap();

    pipeline.clear_usage_records();
    assert!(pipeline.usage_records().is_empty());
    assert!(head.usage_records().is_empty());
}

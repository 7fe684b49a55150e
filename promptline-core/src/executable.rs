use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::{Result, UsageRecord, UsageTotals};

/// A unit that turns an input into an output, optionally keeping a usage
/// ledger.
///
/// Stages that do not call a model keep the defaults and report no usage.
#[async_trait]
pub trait Executable<Input: Send + 'static, Output: Send + 'static>: Send + Sync {
    async fn execute(&self, input: Input) -> Result<Output>;

    fn tracks_usage(&self) -> bool {
        false
    }

    fn usage_records(&self) -> Vec<UsageRecord> {
        Vec::new()
    }

    fn total_token_usage(&self) -> UsageTotals {
        UsageTotals::from_records(&self.usage_records())
    }

    fn clear_usage_records(&self) {}
}

/// Wraps an async closure as a stage that keeps no ledger.
pub struct FnStage<F, Input, Output> {
    func: F,
    _marker: PhantomData<fn(Input) -> Output>,
}

impl<F, Input, Output> FnStage<F, Input, Output> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, Input, Output> Executable<Input, Output> for FnStage<F, Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
    F: Fn(Input) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Output>> + Send,
{
    async fn execute(&self, input: Input) -> Result<Output> {
        (self.func)(input).await
    }
}

#[async_trait]
impl<Input, Output, E> Executable<Input, Output> for std::sync::Arc<E>
where
    Input: Send + 'static,
    Output: Send + 'static,
    E: Executable<Input, Output> + ?Sized,
{
    async fn execute(&self, input: Input) -> Result<Output> {
        self.as_ref().execute(input).await
    }

    fn tracks_usage(&self) -> bool {
        self.as_ref().tracks_usage()
    }

    fn usage_records(&self) -> Vec<UsageRecord> {
        self.as_ref().usage_records()
    }

    fn clear_usage_records(&self) {
        self.as_ref().clear_usage_records()
    }
}

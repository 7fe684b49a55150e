use std::marker::PhantomData;

use crate::{Executable, Result, UsageRecord};

/// Runs `head`, then feeds its output to `tail`.
///
/// Usage from both stages is merged on read, so a pipeline's totals always
/// equal the sum over its stages however the pipelines were nested.
pub struct Pipeline<Head, Tail, Mid> {
    head: Head,
    tail: Tail,
    _marker: PhantomData<fn() -> Mid>,
}

impl<Head, Tail, Mid> Pipeline<Head, Tail, Mid> {
    pub fn new(head: Head, tail: Tail) -> Self {
        Self {
            head,
            tail,
            _marker: PhantomData,
        }
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn tail(&self) -> &Tail {
        &self.tail
    }
}

#[async_trait::async_trait]
impl<Input, Mid, Output, Head, Tail> Executable<Input, Output> for Pipeline<Head, Tail, Mid>
where
    Input: Send + 'static,
    Mid: Send + 'static,
    Output: Send + 'static,
    Head: Executable<Input, Mid>,
    Tail: Executable<Mid, Output>,
{
    async fn execute(&self, input: Input) -> Result<Output> {
        let mid = self.head.execute(input).await?;
        self.tail.execute(mid).await
    }

    fn tracks_usage(&self) -> bool {
        self.head.tracks_usage() || self.tail.tracks_usage()
    }

    fn usage_records(&self) -> Vec<UsageRecord> {
        let mut records = Vec::new();
        if self.head.tracks_usage() {
            records.extend(self.head.usage_records());
        }
        if self.tail.tracks_usage() {
            records.extend(self.tail.usage_records());
        }
        records
    }

    fn clear_usage_records(&self) {
        self.head.clear_usage_records();
        self.tail.clear_usage_records();
    }
}

pub trait ExecutableExt<Input: Send + 'static, Output: Send + 'static>:
    Executable<Input, Output> + Sized
{
    fn then<NextOutput, Next>(self, next: Next) -> Pipeline<Self, Next, Output>
    where
        Next: Executable<Output, NextOutput>,
        NextOutput: Send + 'static,
    {
        Pipeline::new(self, next)
    }
}

impl<Input: Send + 'static, Output: Send + 'static, T> ExecutableExt<Input, Output> for T where
    T: Executable<Input, Output> + Sized
{
}

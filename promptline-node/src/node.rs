use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use promptline_core::{
    parse_correlation_id, BatchItemCollector, BatchItemResult, BatchMetadata, BatchRequest,
    BatchResult, BatchStatus, Capability, ChunkStream, Executable, ItemStatus, LlmConfig,
    OutputParser, PromptlineError, Provider, ProviderBatchItem, ProviderResponse, RequestCounts,
    Result, TokenUsage, UsageLedger, UsageRecord, UsageTotals,
};
use promptline_prompt::PromptTemplate;
use serde::Serialize;
use tracing::Instrument;

type Render<I> = Arc<dyn Fn(&I) -> Result<String> + Send + Sync>;
type Preprocess<I> = Arc<dyn Fn(I) -> I + Send + Sync>;

const MISSING_RESULT: &str = "no result returned";

/// Binds a prompt, a model config, an output parser and a provider.
///
/// Every call that reaches the provider appends exactly one [`UsageRecord`]
/// to the node's ledger before its result is handed back. The ledger is
/// private: callers can read or clear it but never append to it.
pub struct Node<I, O> {
    render: Render<I>,
    preprocess: Option<Preprocess<I>>,
    provider: Arc<dyn Provider>,
    parser: Arc<dyn OutputParser<O>>,
    config: LlmConfig,
    ledger: Arc<UsageLedger>,
}

pub struct NodeBuilder<I, O> {
    render: Option<Render<I>>,
    preprocess: Option<Preprocess<I>>,
    provider: Option<Arc<dyn Provider>>,
    parser: Option<Arc<dyn OutputParser<O>>>,
    config: Option<LlmConfig>,
}

impl<I, O> Default for NodeBuilder<I, O> {
    fn default() -> Self {
        Self {
            render: None,
            preprocess: None,
            provider: None,
            parser: None,
            config: None,
        }
    }
}

impl<I: 'static, O: 'static> NodeBuilder<I, O> {
    /// A `{{expr}}` template rendered against the serialized input.
    pub fn prompt(mut self, template: impl Into<PromptTemplate>) -> Self
    where
        I: Serialize,
    {
        let template = template.into();
        self.render = Some(Arc::new(move |input: &I| {
            let value = serde_json::to_value(input)?;
            template.render(&value)
        }));
        self
    }

    /// Builds the prompt with a function of the input instead of a template.
    pub fn prompt_fn<F>(mut self, prompt: F) -> Self
    where
        F: Fn(&I) -> String + Send + Sync + 'static,
    {
        self.render = Some(Arc::new(move |input: &I| Ok(prompt(input))));
        self
    }

    pub fn preprocess<F>(mut self, preprocess: F) -> Self
    where
        F: Fn(I) -> I + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(preprocess));
        self
    }

    pub fn parser(mut self, parser: impl OutputParser<O> + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `provider` instead of the one the factory would pick for the
    /// config.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<Node<I, O>> {
        let render = self
            .render
            .ok_or_else(|| PromptlineError::InvalidConfig("node requires a prompt".to_string()))?;
        let parser = self
            .parser
            .ok_or_else(|| PromptlineError::InvalidConfig("node requires a parser".to_string()))?;
        let config = self
            .config
            .ok_or_else(|| PromptlineError::InvalidConfig("node requires a config".to_string()))?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => promptline_llm::create_provider(&config)?,
        };

        Ok(Node {
            render,
            preprocess: self.preprocess,
            provider,
            parser,
            config,
            ledger: Arc::new(UsageLedger::new()),
        })
    }
}

impl<I: 'static, O: 'static> Node<I, O> {
    pub fn builder() -> NodeBuilder<I, O> {
        NodeBuilder::default()
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Applies the preprocessor, then renders the prompt.
    pub fn render(&self, input: I) -> Result<String> {
        let input = match &self.preprocess {
            Some(preprocess) => preprocess(input),
            None => input,
        };
        (self.render)(&input)
    }

    fn record(&self, usage: TokenUsage) {
        self.ledger.append(UsageRecord::new(
            self.provider.name(),
            self.config.model(),
            usage,
        ));
    }

    fn parse(&self, text: &str) -> Result<O> {
        self.parser.parse(text).map_err(|err| match err {
            PromptlineError::Parse { .. } => err,
            other => PromptlineError::parse(text, other),
        })
    }

    /// Single-shot call returning the provider response as-is.
    pub async fn invoke_raw(&self, input: I) -> Result<ProviderResponse> {
        let prompt = self.render(input)?;
        let span = tracing::info_span!(
            "node_execute",
            provider = self.provider.name(),
            model = self.config.model(),
        );
        let response = self
            .provider
            .invoke(&prompt, &self.config)
            .instrument(span)
            .await?;
        tracing::debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "model call finished"
        );
        self.record(response.usage.clone());
        Ok(response)
    }

    /// Render, invoke, record usage, parse.
    pub async fn execute(&self, input: I) -> Result<O> {
        let response = self.invoke_raw(input).await?;
        self.parse(&response.content)
    }

    /// Streams raw text chunks. The usage record is appended when the
    /// terminal chunk passes through, so a stream that is dropped early or
    /// ends in an error records nothing.
    pub fn stream(&self, input: I) -> Result<ChunkStream> {
        if !self.provider.supports_streaming() {
            return Err(PromptlineError::capability(
                self.provider.name(),
                Capability::Streaming,
            ));
        }
        let prompt = self.render(input)?;
        let chunks = self.provider.invoke_stream(&prompt, &self.config)?;

        let ledger = Arc::clone(&self.ledger);
        let provider = self.provider.name().to_string();
        let model = self.config.model().to_string();
        Ok(chunks
            .inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    if let Some(usage) = &chunk.usage {
                        ledger.append(UsageRecord::new(&provider, &model, usage.clone()));
                    }
                }
            })
            .boxed())
    }

    /// Renders one prompt per input and submits them as a single job.
    ///
    /// Item `i` is addressed as `req-i`. The node keeps no batch state; the
    /// returned metadata is all that [`Node::retrieve_batch`] needs.
    pub async fn create_batch(&self, inputs: Vec<I>) -> Result<BatchMetadata> {
        if !self.provider.supports_batch() {
            return Err(PromptlineError::capability(
                self.provider.name(),
                Capability::Batch,
            ));
        }

        let requests = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| Ok(BatchRequest::new(index, self.render(input)?)))
            .collect::<Result<Vec<_>>>()?;

        let span = tracing::info_span!(
            "batch_create",
            provider = self.provider.name(),
            model = self.config.model(),
            requests = requests.len(),
        );
        let metadata = self
            .provider
            .create_batch(requests, &self.config)
            .instrument(span)
            .await?;
        tracing::info!(batch_id = %metadata.batch_id, "batch submitted");
        Ok(metadata)
    }

    /// Reads the job's current state. Results are parsed only once the job
    /// is `completed`; every other status comes back with counts alone.
    ///
    /// A completed retrieval yields one item per submitted request, sorted
    /// by index, and appends one usage record covering all of them.
    pub async fn retrieve_batch(&self, metadata: &BatchMetadata) -> Result<BatchResult<O>> {
        let span = tracing::info_span!(
            "batch_retrieve",
            provider = self.provider.name(),
            batch_id = %metadata.batch_id,
        );
        let result = self
            .provider
            .retrieve_batch(metadata, &self.config)
            .instrument(span)
            .await?;

        if result.status != BatchStatus::Completed {
            return Ok(BatchResult {
                status: result.status,
                results: None,
                request_counts: result.request_counts,
            });
        }

        let mut collector = BatchItemCollector::new();
        for item in result.results.unwrap_or_default() {
            collector.insert(item);
        }

        let mut items: BTreeMap<usize, BatchItemResult<O>> = BTreeMap::new();
        for item in collector.into_items() {
            let Some(index) = parse_correlation_id(&item.custom_id) else {
                tracing::warn!(custom_id = %item.custom_id, "ignoring batch item with foreign id");
                continue;
            };
            if items.contains_key(&index) {
                continue;
            }
            items.insert(index, self.item_result(index, item));
        }
        for index in 0..metadata.request_count {
            items.entry(index).or_insert_with(|| {
                tracing::warn!(index, batch_id = %metadata.batch_id, "batch item missing from results");
                BatchItemResult {
                    index,
                    status: ItemStatus::Failed,
                    output: None,
                    raw: None,
                    error: Some(MISSING_RESULT.to_string()),
                    usage: None,
                }
            });
        }
        let items: Vec<_> = items.into_values().collect();

        let usage: TokenUsage = items.iter().filter_map(|item| item.usage.as_ref()).sum();
        self.record(usage);

        let request_counts = result
            .request_counts
            .unwrap_or_else(|| count_items(&items));
        Ok(BatchResult {
            status: result.status,
            results: Some(items),
            request_counts: Some(request_counts),
        })
    }

    fn item_result(&self, index: usize, item: ProviderBatchItem) -> BatchItemResult<O> {
        let ProviderBatchItem {
            status,
            content,
            error,
            usage,
            ..
        } = item;

        match (status, content) {
            (ItemStatus::Success, Some(content)) => match self.parse(&content) {
                Ok(output) => BatchItemResult {
                    index,
                    status: ItemStatus::Success,
                    output: Some(output),
                    raw: Some(content),
                    error: None,
                    usage,
                },
                Err(err) => {
                    tracing::warn!(index, error = %err, "batch item output failed to parse");
                    BatchItemResult {
                        index,
                        status: ItemStatus::Failed,
                        output: None,
                        raw: Some(content),
                        error: Some(err.to_string()),
                        usage,
                    }
                }
            },
            (status, content) => BatchItemResult {
                index,
                status: if status == ItemStatus::Success {
                    ItemStatus::Failed
                } else {
                    status
                },
                output: None,
                raw: content,
                error: Some(error.unwrap_or_else(|| "no content returned".to_string())),
                usage,
            },
        }
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.ledger.records()
    }

    pub fn total_token_usage(&self) -> UsageTotals {
        self.ledger.totals()
    }

    pub fn clear_usage_records(&self) {
        self.ledger.clear()
    }
}

fn count_items<O>(items: &[BatchItemResult<O>]) -> RequestCounts {
    let mut counts = RequestCounts {
        total: items.len(),
        ..RequestCounts::default()
    };
    for item in items {
        match item.status {
            ItemStatus::Success => counts.completed += 1,
            ItemStatus::Failed => counts.failed += 1,
            ItemStatus::Expired => counts.expired += 1,
            ItemStatus::Cancelled => counts.cancelled += 1,
        }
    }
    counts
}

#[async_trait]
impl<I, O> Executable<I, O> for Node<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I) -> Result<O> {
        Node::execute(self, input).await
    }

    fn tracks_usage(&self) -> bool {
        true
    }

    fn usage_records(&self) -> Vec<UsageRecord> {
        Node::usage_records(self)
    }

    fn total_token_usage(&self) -> UsageTotals {
        Node::total_token_usage(self)
    }

    fn clear_usage_records(&self) {
        Node::clear_usage_records(self)
    }
}

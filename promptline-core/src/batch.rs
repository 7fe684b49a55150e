//! Vendor-neutral batch job model.
//!
//! Every adapter maps its own job vocabulary onto [`BatchStatus`] and its own
//! result encoding onto [`ProviderBatchItem`]. Requests are addressed by a
//! correlation id of the form `req-<index>`; retrieval parses it back to
//! restore input order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{PromptlineError, Result, TokenUsage};

const CORRELATION_PREFIX: &str = "req-";

pub fn correlation_id(index: usize) -> String {
    format!("{CORRELATION_PREFIX}{index}")
}

pub fn parse_correlation_id(id: &str) -> Option<usize> {
    id.strip_prefix(CORRELATION_PREFIX)?.parse().ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Expired
                | BatchStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
    Expired,
    Cancelled,
}

/// The handle a caller persists between submission and retrieval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub batch_id: String,
    pub provider: String,
    pub model: String,
    pub request_count: usize,
    pub created_at: DateTime<Utc>,
}

impl BatchMetadata {
    pub fn new(
        batch_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        request_count: usize,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            provider: provider.into(),
            model: model.into(),
            request_count,
            created_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|err| PromptlineError::InvalidConfig(format!("batch metadata: {err}")))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    #[serde(default)]
    pub expired: usize,
    #[serde(default)]
    pub cancelled: usize,
}

/// One rendered prompt addressed by its correlation id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRequest {
    pub custom_id: String,
    pub prompt: String,
}

impl BatchRequest {
    pub fn new(index: usize, prompt: impl Into<String>) -> Self {
        Self {
            custom_id: correlation_id(index),
            prompt: prompt.into(),
        }
    }
}

/// A per-item result as the adapter decoded it, before output parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderBatchItem {
    pub custom_id: String,
    pub status: ItemStatus,
    pub content: Option<String>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ProviderBatchItem {
    pub fn success(
        custom_id: impl Into<String>,
        content: impl Into<String>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            status: ItemStatus::Success,
            content: Some(content.into()),
            error: None,
            usage,
        }
    }

    pub fn failure(
        custom_id: impl Into<String>,
        status: ItemStatus,
        error: impl Into<String>,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            status,
            content: None,
            error: Some(error.into()),
            usage: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderBatchResult {
    pub status: BatchStatus,
    /// Present only when `status` is [`BatchStatus::Completed`].
    pub results: Option<Vec<ProviderBatchItem>>,
    pub request_counts: Option<RequestCounts>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult<O> {
    pub index: usize,
    pub status: ItemStatus,
    /// Set if and only if `status` is success and the parser accepted the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<O>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult<O> {
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<BatchItemResult<O>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_counts: Option<RequestCounts>,
}

/// Merges per-item records that a vendor may spread over several sources
/// (for example a success file and an error file).
///
/// A success is never replaced. A non-success is replaced only by a later
/// success. Otherwise the first record seen for a correlation id wins.
#[derive(Debug, Default)]
pub struct BatchItemCollector {
    order: Vec<String>,
    items: HashMap<String, ProviderBatchItem>,
}

impl BatchItemCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `item` was stored.
    pub fn insert(&mut self, item: ProviderBatchItem) -> bool {
        match self.items.get(&item.custom_id) {
            None => {
                self.order.push(item.custom_id.clone());
                self.items.insert(item.custom_id.clone(), item);
                true
            }
            Some(existing)
                if existing.status != ItemStatus::Success && item.status == ItemStatus::Success =>
            {
                self.items.insert(item.custom_id.clone(), item);
                true
            }
            Some(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_items(mut self) -> Vec<ProviderBatchItem> {
        self.order
            .iter()
            .filter_map(|id| self.items.remove(id))
            .collect()
    }
}

//! Token accounting shared by providers, nodes and pipelines.
//!
//! A [`TokenUsage`] is what a single vendor call reports. Nodes wrap each one
//! in a timestamped [`UsageRecord`] and append it to their private
//! [`UsageLedger`]; [`UsageTotals`] is the summed view callers usually want.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token consumption reported for one call.
///
/// The optional counters are `None` when the vendor or call does not report
/// them at all, which is different from reporting zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Reasoning tokens. For vendors that do not report these separately this
    /// is a best-effort estimate clamped at zero, not an exact count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_calls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_calls: Option<u64>,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    pub fn with_thinking_tokens(mut self, tokens: u64) -> Self {
        self.thinking_tokens = Some(tokens);
        self
    }

    pub fn with_search_calls(mut self, calls: u64) -> Self {
        self.search_calls = Some(calls);
        self
    }

    pub fn with_fetch_calls(mut self, calls: u64) -> Self {
        self.fetch_calls = Some(calls);
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Elementwise sum. An optional counter stays `None` only when both sides
    /// lack it.
    pub fn combine(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            thinking_tokens: add_optional(self.thinking_tokens, other.thinking_tokens),
            search_calls: add_optional(self.search_calls, other.search_calls),
            fetch_calls: add_optional(self.fetch_calls, other.fetch_calls),
        }
    }
}

fn add_optional(left: Option<u64>, right: Option<u64>) -> Option<u64> {
    match (left, right) {
        (None, None) => None,
        (left, right) => Some(left.unwrap_or(0) + right.unwrap_or(0)),
    }
}

impl<'a> std::iter::Sum<&'a TokenUsage> for TokenUsage {
    fn sum<I: Iterator<Item = &'a TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |acc, usage| acc.combine(usage))
    }
}

/// One ledger entry: what a single logical call consumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
}

impl UsageRecord {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            timestamp: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            usage,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageTotals {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let (input_tokens, output_tokens) = records
            .into_iter()
            .fold((0u64, 0u64), |(input, output), record| {
                (
                    input + record.usage.input_tokens,
                    output + record.usage.output_tokens,
                )
            });
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Append-only log of the usage a single owner produced.
///
/// Only the owner appends; everybody else gets snapshots through
/// [`UsageLedger::records`].
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: UsageRecord) {
        self.lock().push(record);
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.lock().clone()
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals::from_records(self.lock().iter())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panic while holding the lock cannot leave a half-written record, so a
    // poisoned ledger is still consistent.
    fn lock(&self) -> MutexGuard<'_, Vec<UsageRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_absent_counters_absent() {
        let left = TokenUsage::new(3, 4);
        let right = TokenUsage::new(1, 2).with_search_calls(2);
        let sum = left.combine(&right);
        assert_eq!(sum.input_tokens, 4);
        assert_eq!(sum.output_tokens, 6);
        assert_eq!(sum.thinking_tokens, None);
        assert_eq!(sum.search_calls, Some(2));
    }

    #[test]
    fn ledger_totals_sum_input_and_output() {
        let ledger = UsageLedger::new();
        ledger.append(UsageRecord::new("openai", "gpt-4o", TokenUsage::new(10, 5)));
        ledger.append(UsageRecord::new("openai", "gpt-4o", TokenUsage::new(7, 3)));
        let totals = ledger.totals();
        assert_eq!(totals.input_tokens, 17);
        assert_eq!(totals.output_tokens, 8);
        assert_eq!(totals.total_tokens, 25);

        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.totals(), UsageTotals::default());
    }
}

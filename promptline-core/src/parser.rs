use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{PromptlineError, Result};

/// Turns raw model text into a typed output.
pub trait OutputParser<Output>: Send + Sync {
    fn parse(&self, text: &str) -> Result<Output>;
}

/// Returns the text unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrParser;

impl OutputParser<String> for StrParser {
    fn parse(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

/// Parses JSON, tolerating a surrounding markdown code fence.
#[derive(Debug)]
pub struct JsonParser<T = crate::Value> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonParser<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonParser<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

pub(crate) fn strip_code_fence(input: &str) -> &str {
    let cleaned = input.trim();
    if cleaned.starts_with("```json") {
        cleaned
            .trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
    } else if cleaned.starts_with("```") {
        cleaned
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        cleaned
    }
}

impl<T: DeserializeOwned> OutputParser<T> for JsonParser<T> {
    fn parse(&self, text: &str) -> Result<T> {
        serde_json::from_str(strip_code_fence(text)).map_err(|err| PromptlineError::parse(text, err))
    }
}

/// Adapts a closure into a parser.
pub struct FnParser<F>(F);

impl<F> FnParser<F> {
    pub fn new(parse: F) -> Self {
        Self(parse)
    }
}

impl<F, Output> OutputParser<Output> for FnParser<F>
where
    F: Fn(&str) -> Result<Output> + Send + Sync,
{
    fn parse(&self, text: &str) -> Result<Output> {
        (self.0)(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_and_bare_fences() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fence("  plain "), "plain");
    }
}

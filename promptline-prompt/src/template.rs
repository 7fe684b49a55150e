use std::sync::OnceLock;

use promptline_core::{PromptlineError, Result, Value};
use regex::Regex;

use crate::expr::{display_value, evaluate};

fn placeholder_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}"))
        .as_ref()
        .map_err(|err| PromptlineError::InvalidConfig(err.to_string()))
}

/// A prompt with `{{expr}}` placeholders.
///
/// A placeholder never fails a render: an expression that cannot be
/// evaluated falls back to looking the raw placeholder text up as a key of
/// the input, and renders as empty when that misses too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The placeholder expressions in order of appearance.
    pub fn placeholders(&self) -> Result<Vec<&str>> {
        Ok(placeholder_pattern()?
            .captures_iter(&self.template)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect())
    }

    pub fn render(&self, input: &Value) -> Result<String> {
        let rendered = placeholder_pattern()?
            .replace_all(&self.template, |caps: &regex::Captures| {
                let expression = &caps[1];
                match evaluate(expression, input) {
                    Ok(value) => display_value(&value),
                    Err(err) => {
                        tracing::warn!(
                            expression,
                            error = %err,
                            "template expression fell back to property lookup"
                        );
                        input.get(expression).map(display_value).unwrap_or_default()
                    }
                }
            })
            .into_owned();
        Ok(rendered)
    }
}

impl From<&str> for PromptTemplate {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl From<String> for PromptTemplate {
    fn from(template: String) -> Self {
        Self::new(template)
    }
}

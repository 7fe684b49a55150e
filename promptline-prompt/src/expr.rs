//! A deliberately small expression language for template placeholders.
//!
//! Supported forms, evaluated against a JSON input:
//!
//! - `name`, `input` (the whole input), `user.address.city`
//! - `items[0]`, `row["first name"]`, `items.length`
//! - `tags.join(", ")`, `name.toUpperCase()`, `name.toLowerCase()`, `name.trim()`
//!
//! Nothing else is evaluated. Callers fall back to a plain key lookup when
//! [`evaluate`] returns an error.

use promptline_core::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("no property '{0}'")]
    MissingProperty(String),
    #[error("index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("method '{0}' is not supported on this value")]
    UnsupportedMethod(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(usize),
    Dot,
    Comma,
    LBracket,
    RBracket,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' | '\'' => {
                let quote = ch;
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                literal.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                        }
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => literal.push(c),
                    }
                }
                if !closed {
                    return Err(ExprError::UnterminatedString);
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let number = digits
                    .parse()
                    .map_err(|_| ExprError::UnexpectedToken(digits.clone()))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !(d.is_alphanumeric() || d == '_' || d == '$') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ExprError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Call { method: String, args: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    root: String,
    segments: Vec<Segment>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken(format!("{token:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let root = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(token) => return Err(ExprError::UnexpectedToken(format!("{token:?}"))),
            None => return Err(ExprError::UnexpectedEnd),
        };

        let mut segments = Vec::new();
        while let Some(token) = self.next() {
            match token {
                Token::Dot => {
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        Some(token) => {
                            return Err(ExprError::UnexpectedToken(format!("{token:?}")))
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    };
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let args = self.parse_args()?;
                        segments.push(Segment::Call { method: name, args });
                    } else {
                        segments.push(Segment::Field(name));
                    }
                }
                Token::LBracket => {
                    let segment = match self.next() {
                        Some(Token::Num(index)) => Segment::Index(index),
                        Some(Token::Str(key)) => Segment::Field(key),
                        Some(token) => {
                            return Err(ExprError::UnexpectedToken(format!("{token:?}")))
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    };
                    self.expect(Token::RBracket)?;
                    segments.push(segment);
                }
                other => return Err(ExprError::UnexpectedToken(format!("{other:?}"))),
            }
        }

        Ok(Expr { root, segments })
    }

    fn parse_args(&mut self) -> Result<Vec<Value>, ExprError> {
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::RParen) => return Ok(args),
                Some(Token::Str(literal)) => args.push(Value::String(literal)),
                Some(Token::Num(number)) => args.push(Value::from(number)),
                Some(token) => return Err(ExprError::UnexpectedToken(format!("{token:?}"))),
                None => return Err(ExprError::UnexpectedEnd),
            }
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(token) => return Err(ExprError::UnexpectedToken(format!("{token:?}"))),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
    }
}

/// Evaluates `expression` with `input` bound as `input` and, when `input` is an
/// object, each of its fields bound by name.
pub fn evaluate(expression: &str, input: &Value) -> Result<Value, ExprError> {
    let expr = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
    }
    .parse()?;

    let mut current = match input.get(&expr.root) {
        Some(value) => value.clone(),
        None if expr.root == "input" => input.clone(),
        None => return Err(ExprError::UnknownIdentifier(expr.root)),
    };

    for segment in expr.segments {
        current = apply(current, segment)?;
    }
    Ok(current)
}

fn apply(value: Value, segment: Segment) -> Result<Value, ExprError> {
    match segment {
        Segment::Field(name) => {
            if name == "length" {
                match &value {
                    Value::Array(items) => return Ok(Value::from(items.len())),
                    Value::String(text) => return Ok(Value::from(text.chars().count())),
                    _ => {}
                }
            }
            match value {
                Value::Object(mut map) => map
                    .remove(&name)
                    .ok_or(ExprError::MissingProperty(name)),
                _ => Err(ExprError::MissingProperty(name)),
            }
        }
        Segment::Index(index) => match value {
            Value::Array(items) => items
                .into_iter()
                .nth(index)
                .ok_or(ExprError::IndexOutOfRange(index)),
            Value::Object(mut map) => map
                .remove(&index.to_string())
                .ok_or_else(|| ExprError::MissingProperty(index.to_string())),
            _ => Err(ExprError::IndexOutOfRange(index)),
        },
        Segment::Call { method, args } => call(value, &method, &args),
    }
}

fn call(value: Value, method: &str, args: &[Value]) -> Result<Value, ExprError> {
    let unsupported = || ExprError::UnsupportedMethod(method.to_string());
    match (method, value) {
        ("join", Value::Array(items)) => {
            let separator = match args.first() {
                Some(Value::String(sep)) => sep.as_str(),
                Some(_) => return Err(unsupported()),
                None => ",",
            };
            let joined = items
                .iter()
                .map(display_value)
                .collect::<Vec<_>>()
                .join(separator);
            Ok(Value::String(joined))
        }
        ("toUpperCase", Value::String(text)) => Ok(Value::String(text.to_uppercase())),
        ("toLowerCase", Value::String(text)) => Ok(Value::String(text.to_lowercase())),
        ("trim", Value::String(text)) => Ok(Value::String(text.trim().to_string())),
        _ => Err(unsupported()),
    }
}

/// How a value is spliced into prompt text: strings verbatim, null as empty,
/// everything else as compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_paths_and_indices() {
        let input = json!({"user": {"tags": ["a", "b"], "name": "Ada"}});
        assert_eq!(evaluate("user.name", &input).unwrap(), json!("Ada"));
        assert_eq!(evaluate("user.tags[1]", &input).unwrap(), json!("b"));
        assert_eq!(evaluate("user[\"name\"]", &input).unwrap(), json!("Ada"));
        assert_eq!(evaluate("user.tags.length", &input).unwrap(), json!(2));
    }

    #[test]
    fn binds_whole_input_as_input() {
        assert_eq!(evaluate("input", &json!("hello")).unwrap(), json!("hello"));
        assert_eq!(evaluate("input.a", &json!({"a": 1})).unwrap(), json!(1));
        assert_eq!(
            evaluate("missing", &json!({"a": 1})).unwrap_err(),
            ExprError::UnknownIdentifier("missing".to_string())
        );
    }

    #[test]
    fn whitelisted_methods_only() {
        let input = json!({"tags": ["x", 2, true], "name": " Ada "});
        assert_eq!(
            evaluate("tags.join(' | ')", &input).unwrap(),
            json!("x | 2 | true")
        );
        assert_eq!(evaluate("name.trim()", &input).unwrap(), json!("Ada"));
        assert!(matches!(
            evaluate("name.constructor()", &input),
            Err(ExprError::UnsupportedMethod(_))
        ));
        assert!(evaluate("a + b", &input).is_err());
    }
}

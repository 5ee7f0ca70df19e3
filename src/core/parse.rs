//! Provider response parsing
//!
//! Model output is untrusted text. Anything a stage wants to read as
//! structured data goes through [`parse_structured`], which extracts the JSON
//! payload, deserializes it and runs the type's `validator` rules. Stages that
//! must keep going on a bad response use [`parse_or_fallback`]; the value used
//! in that case comes from the type's single [`Fallback`] impl, never from an
//! inline literal at the call site.

use std::fmt;

use log::warn;
use serde::de::DeserializeOwned;
use validator::Validate;

/// Failure to turn a provider response into a typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The response was empty or whitespace
    Empty,
    /// No JSON payload, or the payload did not match the type
    Malformed(String),
    /// The payload deserialized but broke a validation rule
    Invalid(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty response"),
            ParseError::Malformed(msg) => write!(f, "malformed response: {msg}"),
            ParseError::Invalid(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Default value used when a provider response cannot be parsed.
pub trait Fallback: Sized {
    fn fallback() -> Self;
}

/// Outcome of [`parse_or_fallback`]
#[derive(Debug)]
pub struct Parsed<T> {
    pub value: T,
    /// Set when `value` is the fallback
    pub error: Option<ParseError>,
}

impl<T> Parsed<T> {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse a provider response into `T` and validate it.
pub fn parse_structured<T>(raw: &str) -> Result<T, ParseError>
where
    T: DeserializeOwned + Validate,
{
    let payload = extract_json(raw)?;
    let value: T =
        serde_json::from_str(payload).map_err(|e| ParseError::Malformed(e.to_string()))?;
    value
        .validate()
        .map_err(|e| ParseError::Invalid(e.to_string()))?;
    Ok(value)
}

/// Parse a provider response, substituting `T::fallback()` on failure.
pub fn parse_or_fallback<T>(stage: &str, raw: &str) -> Parsed<T>
where
    T: DeserializeOwned + Validate + Fallback,
{
    match parse_structured(raw) {
        Ok(value) => Parsed { value, error: None },
        Err(err) => {
            warn!("Stage {stage}: unusable provider response ({err}), using defaults");
            Parsed {
                value: T::fallback(),
                error: Some(err),
            }
        }
    }
}

fn extract_json(raw: &str) -> Result<&str, ParseError> {
    let mut body = raw.trim();
    if body.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(rest) = body.strip_prefix("```") {
        // drop the info string (```json) up to the first newline
        body = rest.split_once('\n').map_or("", |(_, tail)| tail);
        body = body.trim_end().strip_suffix("```").unwrap_or(body).trim();
    }

    if body.starts_with('{') || body.starts_with('[') {
        return Ok(body);
    }

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => Ok(&body[start..=end]),
        _ => Err(ParseError::Malformed("no JSON object found".to_string())),
    }
}

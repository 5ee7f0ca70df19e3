//! The result envelope returned by every stage

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};

use super::error::PipelineError;

/// String-keyed JSON map used for stage data and metadata
pub type DataMap = Map<String, Value>;

/// Outcome of one stage invocation.
///
/// Fields are private: a failing result always carries an error message,
/// and `data` is always present (possibly empty).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingResult {
    success: bool,
    data: DataMap,
    metadata: DataMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl ProcessingResult {
    pub fn success(data: DataMap) -> Self {
        Self {
            success: true,
            data,
            metadata: Self::base_metadata(),
            error_message: None,
        }
    }

    /// Successful result from any JSON value; non-objects land under `"value"`.
    pub fn success_value(value: Value) -> Self {
        Self::success(into_data(value))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "unspecified failure".to_string();
        }
        Self {
            success: false,
            data: DataMap::new(),
            metadata: Self::base_metadata(),
            error_message: Some(message),
        }
    }

    pub fn from_error(err: &PipelineError) -> Self {
        Self::failure(err.to_string()).with_metadata("error_code", err.error_code())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }

    pub fn metadata(&self) -> &DataMap {
        &self.metadata
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The `"content"` text field, if the stage produced one
    pub fn content(&self) -> Option<&str> {
        self.data.get("content").and_then(Value::as_str)
    }

    pub fn into_data(self) -> DataMap {
        self.data
    }

    fn base_metadata() -> DataMap {
        let mut metadata = DataMap::new();
        metadata.insert(
            "processed_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        metadata
    }
}

/// Wrap an arbitrary JSON value as a data map
pub fn into_data(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        Value::Null => DataMap::new(),
        other => {
            let mut map = DataMap::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_failure_always_has_message() {
        let result = ProcessingResult::failure("");
        assert!(!result.is_success());
        assert!(result.error_message().is_some());
        assert!(result.data().is_empty());
    }

    #[test]
    fn test_from_error_carries_code() {
        let err = PipelineError::Timeout("chat".to_string());
        let result = ProcessingResult::from_error(&err);
        assert_eq!(result.metadata().get("error_code"), Some(&json!("timeout")));
    }

    #[test]
    fn test_success_value_wraps_scalars() {
        let result = ProcessingResult::success_value(json!("hello"));
        assert_eq!(result.get("value"), Some(&json!("hello")));

        let result = ProcessingResult::success_value(json!({"content": "hi"}));
        assert_eq!(result.content(), Some("hi"));
    }
}

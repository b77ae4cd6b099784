use crate::{ExecutionError, Value};
use serde::{Deserialize, Serialize};

/// Outcome of one `execute` call.
///
/// The shape is stable regardless of how the workflow was triggered, so
/// front ends can map `success == false` straight to an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl ExecutionResult {
    pub fn success(value: Value, path: Vec<String>) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
            path,
        }
    }

    pub fn failure(error: impl Into<String>, value: Option<Value>, path: Vec<String>) -> Self {
        Self {
            success: false,
            value,
            error: Some(error.into()),
            path,
        }
    }

    pub fn from_error(error: &ExecutionError, value: Option<Value>, path: Vec<String>) -> Self {
        Self::failure(error.to_string(), value, path)
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// `value.message` as a string, when present.
    pub fn message(&self) -> Option<&str> {
        self.value.as_ref()?.get("message")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_without_absent_fields() {
        let ok = ExecutionResult::success(json!({ "message": "hi" }), vec!["start".into()]);
        let encoded = serde_json::to_value(&ok).unwrap();
        assert_eq!(
            encoded,
            json!({ "success": true, "value": { "message": "hi" }, "path": ["start"] })
        );
        assert_eq!(ok.message(), Some("hi"));

        let failed = ExecutionResult::failure("nope", None, vec![]);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "success": false, "error": "nope" })
        );
    }
}

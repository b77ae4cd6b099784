use crate::str_arg;
use async_trait::async_trait;
use chaincore::{Capability, CapabilityError, Value};

/// Parse JSON string to Value
pub struct JsonParse;

#[async_trait]
impl Capability for JsonParse {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let text = str_arg(&args, 0, "json")?;
        serde_json::from_str(text).map_err(|e| CapabilityError::failed(format!("JSON parse error: {}", e)))
    }

    fn description(&self) -> &str {
        "Parse a JSON string"
    }
}

/// Stringify Value to JSON
pub struct JsonStringify;

#[async_trait]
impl Capability for JsonStringify {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let value = args.into_iter().next().unwrap_or(Value::Null);
        serde_json::to_string(&value)
            .map(Value::String)
            .map_err(|e| CapabilityError::failed(format!("JSON stringify error: {}", e)))
    }

    fn description(&self) -> &str {
        "Convert a value to a JSON string"
    }
}

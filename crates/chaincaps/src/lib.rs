//! Standard capability library
//!
//! Capabilities an embedding application can expose to sandboxed nodes:
//! logging, JSON conversion, clocks and outbound HTTP.

mod http;
mod json;
mod log;
mod time;

pub use http::{HttpGet, HttpPost};
pub use json::{JsonParse, JsonStringify};
pub use log::LogCapability;
pub use time::{Now, Sleep};

use chaincore::{CapabilityError, CapabilityRegistry, Value};
use std::sync::Arc;

/// Register all standard capabilities with a registry
pub fn register_all(registry: &mut CapabilityRegistry) {
    let client = reqwest::Client::new();

    registry.register("log.info", Arc::new(LogCapability::info()));
    registry.register("log.warn", Arc::new(LogCapability::warn()));
    registry.register("json.parse", Arc::new(JsonParse));
    registry.register("json.stringify", Arc::new(JsonStringify));
    registry.register("time.now", Arc::new(Now));
    registry.register("time.sleep", Arc::new(Sleep));
    registry.register("http.get", Arc::new(HttpGet::new(client.clone())));
    registry.register("http.post", Arc::new(HttpPost::new(client)));
}

/// A registry holding only the standard capabilities.
pub fn standard() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    register_all(&mut registry);
    registry
}

/// `(path, description)` of every standard capability.
pub fn list() -> Vec<(String, String)> {
    standard().describe()
}

fn str_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, CapabilityError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| CapabilityError::InvalidArguments(format!("'{}' must be a string", name)))
}

use crate::str_arg;
use async_trait::async_trait;
use chaincore::{json, Capability, CapabilityError, Value};

/// HTTP GET returning `{ status, body }`
pub struct HttpGet {
    client: reqwest::Client,
}

impl HttpGet {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for HttpGet {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let url = str_arg(&args, 0, "url")?;
        tracing::debug!("GET {}", url);
        respond(self.client.get(url)).await
    }

    fn description(&self) -> &str {
        "HTTP GET; returns { status, body }"
    }
}

/// HTTP POST of a JSON body returning `{ status, body }`
pub struct HttpPost {
    client: reqwest::Client,
}

impl HttpPost {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for HttpPost {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let url = str_arg(&args, 0, "url")?;
        let body = args.get(1).cloned().unwrap_or(Value::Null);
        tracing::debug!("POST {}", url);
        respond(self.client.post(url).json(&body)).await
    }

    fn description(&self) -> &str {
        "HTTP POST with a JSON body; returns { status, body }"
    }
}

async fn respond(request: reqwest::RequestBuilder) -> Result<Value, CapabilityError> {
    let response = request
        .send()
        .await
        .map_err(|e| CapabilityError::failed(format!("HTTP request failed: {}", e)))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| CapabilityError::failed(format!("Failed to read response: {}", e)))?;

    // JSON bodies are handed back structured, anything else as text.
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    Ok(json!({ "status": status, "body": body }))
}

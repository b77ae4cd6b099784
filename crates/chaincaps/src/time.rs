use async_trait::async_trait;
use chaincore::{Capability, CapabilityError, Value};
use chrono::Utc;
use tokio::time::{sleep, Duration};

/// Current UTC time as an RFC 3339 string
pub struct Now;

#[async_trait]
impl Capability for Now {
    async fn invoke(&self, _args: Vec<Value>) -> Result<Value, CapabilityError> {
        Ok(Value::String(Utc::now().to_rfc3339()))
    }

    fn description(&self) -> &str {
        "Current UTC time (RFC 3339)"
    }
}

/// Delay for a specified number of milliseconds
pub struct Sleep;

#[async_trait]
impl Capability for Sleep {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let delay_ms = args
            .first()
            .and_then(Value::as_f64)
            .filter(|ms| *ms >= 0.0)
            .ok_or_else(|| {
                CapabilityError::InvalidArguments("'ms' must be a non-negative number".to_string())
            })? as u64;

        tracing::debug!("Sleeping for {}ms", delay_ms);
        sleep(Duration::from_millis(delay_ms)).await;
        Ok(Value::Null)
    }

    fn description(&self) -> &str {
        "Sleep for the given number of milliseconds"
    }
}

use async_trait::async_trait;
use chaincore::{Capability, CapabilityError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
}

/// Writes its arguments to the host log
pub struct LogCapability {
    level: Level,
}

impl LogCapability {
    pub fn info() -> Self {
        Self { level: Level::Info }
    }

    pub fn warn() -> Self {
        Self { level: Level::Warn }
    }
}

#[async_trait]
impl Capability for LogCapability {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let line = args
            .iter()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");

        match self.level {
            Level::Info => tracing::info!(target: "chaincaps::script", "{}", line),
            Level::Warn => tracing::warn!(target: "chaincaps::script", "{}", line),
        }
        Ok(Value::Null)
    }

    fn description(&self) -> &str {
        match self.level {
            Level::Info => "Write the arguments to the host log at info level",
            Level::Warn => "Write the arguments to the host log at warn level",
        }
    }
}

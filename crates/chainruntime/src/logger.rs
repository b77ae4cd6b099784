use chaincore::{value::preview, Branch, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub type LoggerError = Box<dyn std::error::Error + Send + Sync>;

/// One entry per node activation, sandboxed or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationLog {
    pub workflow: String,
    pub node: String,
    pub sandboxed: bool,
    pub input: Value,
    /// Continuation calls recorded during the activation.
    pub output: Vec<Branch>,
    /// Diagnostic output captured while the activation ran.
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LoggedError>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Receives activation logs.
pub trait ActivationLogger: Send + Sync {
    fn log(&self, entry: &ActivationLog) -> Result<(), LoggerError>;
}

/// Deliver `entry` without letting the logger affect execution.
pub(crate) fn deliver(logger: &dyn ActivationLogger, entry: &ActivationLog) {
    match catch_unwind(AssertUnwindSafe(|| logger.log(entry))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Activation logger failed: {}", e),
        Err(_) => tracing::warn!("Activation logger panicked"),
    }
}

/// Writes activation logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl ActivationLogger for TracingLogger {
    fn log(&self, entry: &ActivationLog) -> Result<(), LoggerError> {
        let targets: Vec<&str> = entry.output.iter().map(|b| b.target.as_str()).collect();
        match &entry.error {
            Some(error) => tracing::warn!(
                workflow = %entry.workflow,
                node = %entry.node,
                sandboxed = entry.sandboxed,
                duration_ms = entry.duration_ms,
                input = %preview(&entry.input, 200),
                "Activation failed: {}",
                error.message
            ),
            None => tracing::info!(
                workflow = %entry.workflow,
                node = %entry.node,
                sandboxed = entry.sandboxed,
                duration_ms = entry.duration_ms,
                input = %preview(&entry.input, 200),
                "Activation completed -> {:?}",
                targets
            ),
        }
        for line in &entry.logs {
            tracing::info!(workflow = %entry.workflow, node = %entry.node, "| {}", line);
        }
        Ok(())
    }
}

/// Adapter turning a closure into an [`ActivationLogger`].
pub struct FnLogger<F>(F);

impl<F> ActivationLogger for FnLogger<F>
where
    F: Fn(&ActivationLog) -> Result<(), LoggerError> + Send + Sync,
{
    fn log(&self, entry: &ActivationLog) -> Result<(), LoggerError> {
        (self.0)(entry)
    }
}

pub fn logger_fn<F>(func: F) -> FnLogger<F>
where
    F: Fn(&ActivationLog) -> Result<(), LoggerError> + Send + Sync,
{
    FnLogger(func)
}

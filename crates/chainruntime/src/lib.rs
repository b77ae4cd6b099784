//! Workflow execution runtime
//!
//! This crate runs validated workflow graphs: the executor follows each
//! node's continuation calls, the sandbox hosts restricted nodes on isolated
//! Lua workers, and the runtime facade keeps the registered workflows.

mod executor;
pub mod loader;
mod logger;
mod runtime;
pub mod sandbox;

pub use executor::WorkflowExecutor;
pub use loader::{load_workflow_file, ScriptNode, ScriptWorkflow};
pub use logger::{logger_fn, ActivationLog, ActivationLogger, FnLogger, LoggedError, LoggerError, TracingLogger};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use sandbox::{SandboxActivation, SandboxConfig, SandboxHost, SandboxWorker};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure raised by native node logic.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}")]
    InvalidInputType {
        field: String,
        expected: String,
    },

    #[error("{0}")]
    ExecutionFailed(String),

    #[error("Node panicked: {0}")]
    Panicked(String),
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NodeError::ExecutionFailed(message.into())
    }
}

/// Construction-time validation and registration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Workflow must contain at least one node")]
    NoNodes,

    #[error("Workflow must contain a node named 'start'")]
    MissingStart,

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Missing capability '{path}' required by node '{node}'")]
    MissingCapability {
        node: String,
        path: String,
    },

    #[error("Unsupported environment: node '{node}' needs sandbox support, which is not available")]
    UnsupportedEnvironment {
        node: String,
    },
}

/// Failure raised by a capability implementation.
#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn failed(message: impl Into<String>) -> Self {
        CapabilityError::Failed(message.into())
    }
}

/// Failures of a sandboxed activation.
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Sandbox timeout: activation exceeded {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Capability '{name}' failed: {message}")]
    Capability {
        name: String,
        message: String,
    },

    #[error("Sandbox worker provisioning failed: {0}")]
    Provisioning(String),

    #[error("Failed to load sandboxed logic: {0}")]
    LogicLoad(String),

    #[error("{message}")]
    Script {
        message: String,
        trace: Option<String>,
    },

    #[error("Sandbox worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Sandbox support is not available in this build")]
    Unsupported,
}

impl SandboxError {
    /// Errors after which the worker must not be reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::WorkerCrashed(_) | SandboxError::Provisioning(_)
        )
    }
}

/// Activation-time failures. These never escape `execute`; they are
/// rendered into `ExecutionResult::error`.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error("Circular dependency detected: {} -> {node}", .path.join(" -> "))]
    CircularDependency {
        path: Vec<String>,
        node: String,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error(transparent)]
    Logic(#[from] NodeError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ExecutionError {
    /// Diagnostic trace, when the failure carries one.
    pub fn trace(&self) -> Option<String> {
        match self {
            ExecutionError::Sandbox(SandboxError::Script { trace, .. }) => trace.clone(),
            other => Some(format!("{:?}", other)),
        }
    }
}

use crate::{events::EventEmitter, ExecutionId, Next, NodeError, Value};
use async_trait::async_trait;
use std::future::Future;

/// Core trait implemented by trusted (in-process) node logic
#[async_trait]
pub trait NodeLogic: Send + Sync {
    /// Run one activation.
    ///
    /// Successors are named through `next`; nothing recorded there runs
    /// until this future has settled.
    async fn run(&self, ctx: NodeContext, next: Next) -> Result<(), NodeError>;
}

/// Execution context passed to each activation
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,

    /// Name of the workflow being executed
    pub workflow: String,

    /// Name of the node being activated
    pub node: String,

    /// Data passed by the predecessor (or the trigger, for `start`)
    pub input: Value,

    /// Event emitter for diagnostics; its output is captured in the activation log
    pub events: EventEmitter,
}

impl NodeContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow: impl Into<String>,
        node: impl Into<String>,
        input: Value,
        events: EventEmitter,
    ) -> Self {
        Self {
            execution_id,
            workflow: workflow.into(),
            node: node.into(),
            input,
            events,
        }
    }

    /// Get a required input field or return error
    pub fn require(&self, field: &str) -> Result<&Value, NodeError> {
        self.input
            .get(field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| NodeError::MissingInput(field.to_string()))
    }

    /// Get a required numeric input field
    pub fn require_f64(&self, field: &str) -> Result<f64, NodeError> {
        self.require(field)?
            .as_f64()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: field.to_string(),
                expected: "number".to_string(),
            })
    }

    /// Get a required string input field
    pub fn require_str(&self, field: &str) -> Result<&str, NodeError> {
        self.require(field)?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: field.to_string(),
                expected: "string".to_string(),
            })
    }

    /// Emit an info line (captured as diagnostic output)
    pub fn log(&self, message: impl Into<String>) {
        self.events.info(message);
    }
}

/// Adapter turning an async closure into [`NodeLogic`].
pub struct FnLogic<F>(F);

#[async_trait]
impl<F, Fut> NodeLogic for FnLogic<F>
where
    F: Fn(NodeContext, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), NodeError>> + Send,
{
    async fn run(&self, ctx: NodeContext, next: Next) -> Result<(), NodeError> {
        (self.0)(ctx, next).await
    }
}

/// Wrap an async closure as node logic.
///
/// ```ignore
/// let start = logic_fn(|ctx, next| async move {
///     next.success(ctx.input);
///     Ok(())
/// });
/// ```
pub fn logic_fn<F, Fut>(func: F) -> FnLogic<F>
where
    F: Fn(NodeContext, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), NodeError>> + Send,
{
    FnLogic(func)
}

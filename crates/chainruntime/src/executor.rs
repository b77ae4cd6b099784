use crate::logger::{self, ActivationLog, ActivationLogger, LoggedError};
use crate::sandbox::SandboxHost;
use chaincore::value::{error_message, shallow_merge, DEFAULT_ERROR_MESSAGE};
use chaincore::{
    Branch, EventBus, ExecutionError, ExecutionEvent, ExecutionId, ExecutionResult,
    Next, Node, NodeContext, NodeError, NodeKind, Value, WorkflowGraph, ERROR, START, SUCCESS,
};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// Drives one workflow graph from `start` to a terminal sentinel.
///
/// Nodes never call each other. Each activation only records continuation
/// calls; the executor reads them once the activation has settled and
/// decides what runs next.
pub struct WorkflowExecutor {
    sandbox: Arc<SandboxHost>,
    event_bus: Arc<EventBus>,
    logger: Option<Arc<dyn ActivationLogger>>,
}

impl WorkflowExecutor {
    pub fn new(sandbox: Arc<SandboxHost>, event_bus: Arc<EventBus>) -> Self {
        Self {
            sandbox,
            event_bus,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ActivationLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn sandbox(&self) -> &Arc<SandboxHost> {
        &self.sandbox
    }

    /// Execute `graph` with `input` handed to its `start` node.
    ///
    /// Never fails: every error ends up in the returned result.
    pub async fn execute(&self, graph: &WorkflowGraph, input: Value) -> ExecutionResult {
        let execution_id = ExecutionId::new_v4();
        let start_time = Instant::now();

        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow: graph.name().to_string(),
            timestamp: Utc::now(),
        });

        tracing::info!("Starting workflow execution: {} ({})", graph.name(), execution_id);

        let run = Execution {
            executor: self,
            graph,
            execution_id,
        };
        let result = run.resolve(START.to_string(), input, Vec::new()).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        if result.success {
            tracing::info!(
                "Workflow {} completed in {}ms via {:?}",
                graph.name(),
                duration_ms,
                result.path
            );
        } else {
            tracing::warn!(
                "Workflow {} failed in {}ms: {}",
                graph.name(),
                duration_ms,
                result.error.as_deref().unwrap_or(DEFAULT_ERROR_MESSAGE)
            );
        }

        self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            workflow: graph.name().to_string(),
            success: result.success,
            duration_ms,
            timestamp: Utc::now(),
        });

        result
    }
}

/// State of one `execute` call.
struct Execution<'a> {
    executor: &'a WorkflowExecutor,
    graph: &'a WorkflowGraph,
    execution_id: ExecutionId,
}

impl Execution<'_> {
    fn resolve(
        &self,
        target: String,
        input: Value,
        path: Vec<String>,
    ) -> BoxFuture<'_, ExecutionResult> {
        async move {
            if path.contains(&target) {
                let error = ExecutionError::CircularDependency {
                    path: path.clone(),
                    node: target.clone(),
                };
                tracing::warn!("{}", error);
                let mut trail = path;
                trail.push(target);
                return ExecutionResult::from_error(&error, Some(input), trail);
            }

            let node = match self.graph.node(&target) {
                Some(node) => node,
                None => return terminal(target, input, path),
            };

            let mut path = path;
            path.push(target);

            let started = Instant::now();
            let calls = match self.activate(node, input.clone()).await {
                Ok(calls) => calls,
                Err(error) => {
                    return ExecutionResult::from_error(&error, Some(input), path);
                }
            };

            let result = match calls.len() {
                0 => ExecutionResult::success(input, path),
                1 => {
                    let branch = calls[0].clone();
                    self.resolve(branch.target, branch.data, path).await
                }
                _ => self.fan_out(node, input, calls.clone(), path).await,
            };

            self.completed(node, calls, result.clone(), started);
            result
        }
        .boxed()
    }

    /// Run every branch target for one hop, then resolve what they asked for.
    async fn fan_out(
        &self,
        node: &Node,
        input: Value,
        calls: Vec<Branch>,
        path: Vec<String>,
    ) -> ExecutionResult {
        tracing::debug!(
            "Node '{}' fanned out to {} branches in workflow {}",
            node.name,
            calls.len(),
            self.graph.name()
        );

        let activations = calls.into_iter().map(|branch| self.branch(branch, &path));
        let outcomes = join_all(activations).await;

        // Group intercepted calls by target, in order of first appearance.
        let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
        for outcome in outcomes {
            let intercepted = match outcome {
                Ok(intercepted) => intercepted,
                Err(failure) => return failure,
            };
            for Branch { target, data } in intercepted {
                match groups.iter_mut().find(|(name, _)| *name == target) {
                    Some((_, contributions)) => contributions.push(data),
                    None => groups.push((target, vec![data])),
                }
            }
        }

        if groups.is_empty() {
            return ExecutionResult::success(input, path);
        }

        let resolutions = groups.into_iter().map(|(target, contributions)| {
            self.resolve(target, shallow_merge(contributions), path.clone())
        });
        let results = join_all(resolutions).await;

        let mut chosen = match results.iter().position(|r| !r.success) {
            Some(failed) => results[failed].clone(),
            None => results[0].clone(),
        };
        if chosen.path.is_empty() {
            chosen.path = path;
        }
        chosen
    }

    /// Activate one fan-out branch directly, outside the cycle bookkeeping.
    ///
    /// Returns the continuation calls it recorded, or the failure ending the
    /// whole fan-out.
    async fn branch(&self, branch: Branch, path: &[String]) -> Result<Vec<Branch>, ExecutionResult> {
        let Branch { target, data } = branch;

        // Sentinels and unknown names are forwarded untouched and settled by `resolve`.
        let node = match self.graph.node(&target) {
            Some(node) => node,
            None => return Ok(vec![Branch { target, data }]),
        };

        let mut trail = path.to_vec();
        trail.push(target);

        let started = Instant::now();
        match self.activate(node, data.clone()).await {
            Ok(intercepted) => {
                let result = ExecutionResult::success(data, trail);
                self.completed(node, intercepted.clone(), result, started);
                Ok(intercepted)
            }
            Err(error) => Err(ExecutionResult::from_error(&error, Some(data), trail)),
        }
    }

    /// Run a node's logic once and collect its continuation calls.
    async fn activate(&self, node: &Node, input: Value) -> Result<Vec<Branch>, ExecutionError> {
        let workflow = self.graph.name();
        let bus = &self.executor.event_bus;

        bus.emit(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            workflow: workflow.to_string(),
            node: node.name.clone(),
            sandboxed: node.is_sandboxed(),
            timestamp: Utc::now(),
        });
        tracing::debug!("Activating node '{}' in workflow {}", node.name, workflow);

        let events = bus.create_emitter(self.execution_id, node.name.clone());
        let timestamp = Utc::now();
        let started = Instant::now();

        let (calls, outcome) = match &node.kind {
            NodeKind::Native(logic) => {
                let next = Next::new();
                let ctx = NodeContext::new(
                    self.execution_id,
                    workflow,
                    node.name.clone(),
                    input.clone(),
                    events.clone(),
                );
                let outcome = match AssertUnwindSafe(logic.run(ctx, next.clone()))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(ExecutionError::from(e)),
                    Err(panic) => Err(ExecutionError::from(NodeError::Panicked(panic_message(panic)))),
                };
                (next.take_branches(), outcome)
            }
            NodeKind::Sandboxed {
                script,
                capabilities,
            } => {
                let activation = self
                    .executor
                    .sandbox
                    .activate(
                        workflow,
                        &node.name,
                        script.clone(),
                        capabilities.clone(),
                        input.clone(),
                    )
                    .await;
                events.capture_all(activation.logs);
                match activation.outcome {
                    Ok(calls) => (calls, Ok(())),
                    Err(e) => (Vec::new(), Err(ExecutionError::from(e))),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Err(error) = &outcome {
            tracing::error!("Node '{}' in workflow {} failed: {}", node.name, workflow, error);
            bus.emit(ExecutionEvent::NodeFailed {
                execution_id: self.execution_id,
                workflow: workflow.to_string(),
                node: node.name.clone(),
                error: error.to_string(),
                timestamp: Utc::now(),
            });
        }

        if let Some(activation_logger) = &self.executor.logger {
            let entry = ActivationLog {
                workflow: workflow.to_string(),
                node: node.name.clone(),
                sandboxed: node.is_sandboxed(),
                input,
                output: calls.clone(),
                logs: events.take_captured(),
                error: outcome.as_ref().err().map(|error| LoggedError {
                    message: error.to_string(),
                    trace: error.trace(),
                }),
                timestamp,
                duration_ms,
            };
            logger::deliver(activation_logger.as_ref(), &entry);
        }

        outcome.map(|()| calls)
    }

    fn completed(&self, node: &Node, calls: Vec<Branch>, result: ExecutionResult, started: Instant) {
        self.executor.event_bus.emit(ExecutionEvent::NodeCompleted {
            execution_id: self.execution_id,
            workflow: self.graph.name().to_string(),
            node: node.name.clone(),
            calls,
            result,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

/// Settle a target that is not a node of the graph.
fn terminal(target: String, input: Value, mut path: Vec<String>) -> ExecutionResult {
    let error = match target.as_str() {
        SUCCESS => None,
        ERROR => Some(error_message(&input).unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string())),
        _ => {
            tracing::warn!("Continuation targets unknown node '{}'", target);
            Some(ExecutionError::NodeNotFound(target.clone()).to_string())
        }
    };
    path.push(target);
    match error {
        None => ExecutionResult::success(input, path),
        Some(message) => ExecutionResult::failure(message, Some(input), path),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

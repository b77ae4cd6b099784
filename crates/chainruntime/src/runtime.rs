use crate::logger::{ActivationLogger, TracingLogger};
use crate::sandbox::{self, SandboxConfig, SandboxHost};
use crate::WorkflowExecutor;
use chaincore::{
    EventBus, ExecutionError, ExecutionEvent, ExecutionResult, FlowError, Value,
    WorkflowDefinition, WorkflowError, WorkflowGraph,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Main runtime for registering and executing workflows
pub struct FlowRuntime {
    executor: Arc<WorkflowExecutor>,
    sandbox: Arc<SandboxHost>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<String, Arc<WorkflowGraph>>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let logger: Option<Arc<dyn ActivationLogger>> = if config.log_activations {
            Some(Arc::new(TracingLogger))
        } else {
            None
        };
        Self::build(config, logger)
    }

    /// Create a runtime that reports every activation to `logger`
    pub fn with_logger(config: RuntimeConfig, logger: Arc<dyn ActivationLogger>) -> Self {
        Self::build(config, Some(logger))
    }

    fn build(config: RuntimeConfig, logger: Option<Arc<dyn ActivationLogger>>) -> Self {
        let sandbox = Arc::new(SandboxHost::new(config.sandbox.clone()));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        let mut executor = WorkflowExecutor::new(sandbox.clone(), event_bus.clone());
        if let Some(logger) = logger {
            executor = executor.with_logger(logger);
        }

        Self {
            executor: Arc::new(executor),
            sandbox,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate and register a workflow under `name`.
    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowGraph>, WorkflowError> {
        let name = name.into();
        let graph = Arc::new(WorkflowGraph::build(
            name.clone(),
            definition,
            sandbox::support(),
        )?);

        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&name) {
            return Err(WorkflowError::AlreadyRegistered(name));
        }
        workflows.insert(name.clone(), graph.clone());

        tracing::info!(
            "Registered workflow '{}' ({} nodes)",
            name,
            graph.nodes().len()
        );
        Ok(graph)
    }

    /// Execute a registered workflow by name.
    ///
    /// Never errors; an unknown name yields a failed result.
    pub async fn execute(&self, name: &str, input: Value) -> ExecutionResult {
        let graph = self.workflows.read().await.get(name).cloned();
        match graph {
            Some(graph) => self.executor.execute(&graph, input).await,
            None => {
                let error = ExecutionError::WorkflowNotFound(name.to_string());
                tracing::warn!("{}", error);
                ExecutionResult::from_error(&error, Some(input), Vec::new())
            }
        }
    }

    /// Unregister a workflow and tear down its sandbox worker.
    pub async fn remove_workflow(&self, name: &str) -> Result<(), WorkflowError> {
        let removed = self.workflows.write().await.remove(name);
        match removed {
            Some(_) => {
                self.sandbox.remove_worker(name).await;
                tracing::info!("Removed workflow '{}'", name);
                Ok(())
            }
            None => Err(WorkflowError::NotFound(name.to_string())),
        }
    }

    pub async fn workflow(&self, name: &str) -> Option<Arc<WorkflowGraph>> {
        self.workflows.read().await.get(name).cloned()
    }

    /// Registered workflow names, sorted.
    pub async fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tear down the sandbox worker bound to `name`. Idempotent.
    pub async fn remove_worker(&self, name: &str) -> bool {
        self.sandbox.remove_worker(name).await
    }

    /// Tear down every sandbox worker. Idempotent.
    pub async fn cleanup(&self) {
        self.sandbox.cleanup().await;
    }

    pub async fn worker_count(&self) -> usize {
        self.sandbox.worker_count().await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    pub sandbox: SandboxConfig,
    /// Report every activation through `tracing` when no logger is supplied.
    pub log_activations: bool,
}

impl RuntimeConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            sandbox: SandboxConfig::default(),
            log_activations: false,
        }
    }
}

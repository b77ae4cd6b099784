//! Capability sandbox for restricted nodes.
//!
//! One worker per workflow name, provisioned lazily on the first sandboxed
//! activation and reused afterwards. Concurrent activations of the same
//! workflow share (and queue on) that worker.

#[cfg(feature = "sandbox")]
mod lua;
mod protocol;
mod worker;

pub use protocol::SandboxActivation;
pub use worker::SandboxWorker;

use chaincore::{CapabilityTable, SandboxError, SandboxSupport, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default wall-clock budget of one sandboxed activation.
pub const DEFAULT_ACTIVATION_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub activation_timeout_ms: u64,
}

impl SandboxConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            activation_timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            activation_timeout_ms: DEFAULT_ACTIVATION_TIMEOUT_MS,
        }
    }
}

/// Whether this build can host sandboxed nodes.
pub fn support() -> SandboxSupport {
    if cfg!(feature = "sandbox") {
        SandboxSupport::Available
    } else {
        SandboxSupport::Unavailable
    }
}

/// Owns the workers, keyed by workflow name.
pub struct SandboxHost {
    config: SandboxConfig,
    workers: Mutex<HashMap<String, Arc<SandboxWorker>>>,
}

impl SandboxHost {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run a restricted node's script on the workflow's worker.
    ///
    /// Never errors: every failure is reported in the returned activation.
    pub async fn activate(
        &self,
        workflow: &str,
        node: &str,
        script: Arc<str>,
        capabilities: Arc<CapabilityTable>,
        input: Value,
    ) -> SandboxActivation {
        let worker = match self.worker(workflow).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!("Failed to provision sandbox for '{}': {}", workflow, e);
                return SandboxActivation::failed(e);
            }
        };

        let activation = worker.activate(node, script, capabilities, input).await;

        if let Err(e) = &activation.outcome {
            if e.is_fatal() {
                tracing::warn!("Tearing down sandbox worker for '{}': {}", workflow, e);
                self.discard(workflow, &worker).await;
            }
        }
        activation
    }

    /// Tear down the worker bound to `workflow`. Idempotent.
    pub async fn remove_worker(&self, workflow: &str) -> bool {
        let removed = self.workers.lock().await.remove(workflow);
        match removed {
            Some(worker) => {
                worker.shutdown();
                tracing::info!("Removed sandbox worker for workflow '{}'", workflow);
                true
            }
            None => false,
        }
    }

    /// Tear down every worker. Idempotent.
    pub async fn cleanup(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        for (workflow, worker) in workers {
            worker.shutdown();
            tracing::debug!("Stopped sandbox worker for workflow '{}'", workflow);
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn has_worker(&self, workflow: &str) -> bool {
        self.workers.lock().await.contains_key(workflow)
    }

    /// The live worker bound to `workflow`, provisioning one if needed.
    ///
    /// Provisioning happens outside the map lock so other workflows are not
    /// held up; if two activations race, the first insert wins.
    async fn worker(&self, workflow: &str) -> Result<Arc<SandboxWorker>, SandboxError> {
        if let Some(worker) = self.live_worker(workflow).await {
            return Ok(worker);
        }

        let provisioned =
            Arc::new(SandboxWorker::provision(workflow, self.config.activation_timeout()).await?);

        let mut workers = self.workers.lock().await;
        match workers.get(workflow) {
            Some(current) if current.is_alive() => {
                provisioned.shutdown();
                Ok(current.clone())
            }
            _ => {
                workers.insert(workflow.to_string(), provisioned.clone());
                Ok(provisioned)
            }
        }
    }

    async fn live_worker(&self, workflow: &str) -> Option<Arc<SandboxWorker>> {
        let mut workers = self.workers.lock().await;
        let worker = workers.get(workflow)?;
        if worker.is_alive() {
            return Some(worker.clone());
        }
        tracing::warn!("Sandbox worker for '{}' is gone, re-provisioning", workflow);
        workers.remove(workflow);
        None
    }

    async fn discard(&self, workflow: &str, worker: &Arc<SandboxWorker>) {
        let mut workers = self.workers.lock().await;
        if workers
            .get(workflow)
            .map_or(false, |current| Arc::ptr_eq(current, worker))
        {
            workers.remove(workflow);
        }
        worker.shutdown();
    }
}

impl Default for SandboxHost {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

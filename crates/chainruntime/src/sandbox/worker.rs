use super::protocol::{Activate, CapabilityRequest, Interrupt, SandboxActivation, WorkerCommand};
use chaincore::{CapabilityTable, SandboxError, Value};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[cfg(feature = "sandbox")]
use super::lua::spawn_worker;

#[cfg(not(feature = "sandbox"))]
async fn spawn_worker(
    _workflow: &str,
    _requests: mpsc::UnboundedSender<CapabilityRequest>,
    _interrupt: Arc<Interrupt>,
) -> Result<mpsc::UnboundedSender<WorkerCommand>, SandboxError> {
    Err(SandboxError::Unsupported)
}

/// Whitelists of the activations currently in flight, by activation id.
type Sessions = Arc<Mutex<HashMap<u64, Arc<CapabilityTable>>>>;

/// Host-side handle to one isolated worker.
///
/// Activations are queued on the worker's single command channel and run
/// one at a time; capability calls are relayed back here and answered by id.
pub struct SandboxWorker {
    workflow: String,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    interrupt: Arc<Interrupt>,
    sessions: Sessions,
    next_activation: AtomicU64,
    timeout: Duration,
    relay: JoinHandle<()>,
}

impl SandboxWorker {
    pub async fn provision(workflow: &str, timeout: Duration) -> Result<Self, SandboxError> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(Interrupt::default());
        let commands = spawn_worker(workflow, requests_tx, interrupt.clone()).await?;
        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));

        let relay = tokio::spawn(relay(requests_rx, commands.clone(), sessions.clone()));

        tracing::info!("Provisioned sandbox worker for workflow '{}'", workflow);

        Ok(Self {
            workflow: workflow.to_string(),
            commands,
            interrupt,
            sessions,
            next_activation: AtomicU64::new(1),
            timeout,
            relay,
        })
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Whether the worker thread is still receiving commands.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Run `script` with only `capabilities` in scope.
    pub async fn activate(
        &self,
        node: &str,
        script: Arc<str>,
        capabilities: Arc<CapabilityTable>,
        input: Value,
    ) -> SandboxActivation {
        let id = self.next_activation.fetch_add(1, Ordering::Relaxed);
        let names = capabilities.names().to_vec();
        self.sessions().insert(id, capabilities);

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = WorkerCommand::Activate(Activate {
            id,
            workflow: self.workflow.clone(),
            node: node.to_string(),
            script,
            capabilities: names,
            input,
            reply: reply_tx,
        });

        let activation = if self.commands.send(command).is_err() {
            SandboxActivation::failed(SandboxError::WorkerCrashed(
                "worker is not running".to_string(),
            ))
        } else {
            match tokio::time::timeout(self.timeout, reply_rx).await {
                Ok(Ok(activation)) => activation,
                Ok(Err(_)) => SandboxActivation::failed(SandboxError::WorkerCrashed(
                    "worker dropped the activation".to_string(),
                )),
                Err(_) => {
                    tracing::warn!(
                        "Sandboxed node '{}' in workflow '{}' timed out after {:?}",
                        node,
                        self.workflow,
                        self.timeout
                    );
                    // Frees the worker for the activations queued behind this one.
                    self.interrupt.cancel(id);
                    let _ = self.commands.send(WorkerCommand::Cancel { activation: id });
                    SandboxActivation::failed(SandboxError::Timeout(self.timeout))
                }
            }
        };

        // Late capability calls from a timed-out activation are refused.
        self.sessions().remove(&id);
        activation
    }

    /// Stop the worker thread and the relay. Idempotent.
    ///
    /// A script still running is interrupted; the thread exits once it
    /// unwinds.
    pub fn shutdown(&self) {
        self.interrupt.shut_down();
        let _ = self.commands.send(WorkerCommand::Shutdown);
        self.relay.abort();
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<CapabilityTable>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SandboxWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Answer capability requests from the worker until it goes away.
async fn relay(
    mut requests: mpsc::UnboundedReceiver<CapabilityRequest>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    sessions: Sessions,
) {
    while let Some(request) = requests.recv().await {
        let capability = sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(&request.activation).cloned())
            .and_then(|table| table.get(&request.name));
        let commands = commands.clone();

        tokio::spawn(async move {
            let CapabilityRequest { id, name, args, .. } = request;
            let result = match capability {
                Some(capability) => {
                    match AssertUnwindSafe(capability.invoke(args)).catch_unwind().await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("capability '{}' panicked", name)),
                    }
                }
                None => Err(format!(
                    "capability '{}' is not available to this activation",
                    name
                )),
            };
            if let Err(message) = &result {
                tracing::debug!(id, "Capability '{}' failed: {}", name, message);
            }
            let _ = commands.send(WorkerCommand::CapabilityResult { id, result });
        });
    }
}

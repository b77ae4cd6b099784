//! Messages exchanged between the host and a sandbox worker thread.

use chaincore::{Branch, SandboxError, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Host → worker.
pub(crate) enum WorkerCommand {
    Activate(Activate),
    /// Answer to a [`CapabilityRequest`], correlated by `id`.
    CapabilityResult {
        id: u64,
        result: Result<Value, String>,
    },
    /// The host gave up on this activation; stop waiting on its capability call.
    Cancel { activation: u64 },
    Shutdown,
}

/// Run one node's script in a fresh scope.
pub(crate) struct Activate {
    pub id: u64,
    pub workflow: String,
    pub node: String,
    pub script: Arc<str>,
    /// Names bound inside the scope; nothing else is.
    pub capabilities: Vec<String>,
    pub input: Value,
    pub reply: oneshot::Sender<SandboxActivation>,
}

/// Worker → host: invoke a whitelisted capability.
#[derive(Debug)]
pub(crate) struct CapabilityRequest {
    pub id: u64,
    pub activation: u64,
    pub name: String,
    pub args: Vec<Value>,
}

/// Outcome of one sandboxed activation.
#[derive(Debug)]
pub struct SandboxActivation {
    /// Lines printed by the script.
    pub logs: Vec<String>,
    pub outcome: Result<Vec<Branch>, SandboxError>,
}

impl SandboxActivation {
    pub fn failed(error: SandboxError) -> Self {
        Self {
            logs: Vec::new(),
            outcome: Err(error),
        }
    }
}

/// Stop requests shared by a worker handle and its thread.
///
/// The thread polls this from inside running scripts, so a script stuck in
/// a loop still stops when its activation is abandoned or the worker is torn
/// down. Activation ids start at 1; 0 means nothing is running.
#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    shutdown: AtomicBool,
    running: AtomicU64,
    cancelled: AtomicU64,
}

#[cfg_attr(not(feature = "sandbox"), allow(dead_code))]
impl Interrupt {
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn cancel(&self, activation: u64) {
        self.cancelled.store(activation, Ordering::SeqCst);
    }

    /// Called by the worker thread before it runs `activation`.
    pub fn begin(&self, activation: u64) {
        self.running.store(activation, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the running script must stop.
    pub fn requested(&self) -> bool {
        if self.is_shut_down() {
            return true;
        }
        let running = self.running.load(Ordering::SeqCst);
        running != 0 && self.cancelled.load(Ordering::SeqCst) == running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_only_stops_the_named_activation() {
        let interrupt = Interrupt::default();
        assert!(!interrupt.requested());

        interrupt.cancel(2);
        interrupt.begin(1);
        assert!(!interrupt.requested());
        interrupt.begin(2);
        assert!(interrupt.requested());
        interrupt.begin(3);
        assert!(!interrupt.requested());

        interrupt.shut_down();
        assert!(interrupt.requested());
    }
}

use crate::{Branch, ExecutionResult, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Lifecycle events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: ExecutionId,
        workflow: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        workflow: String,
        node: String,
        sandboxed: bool,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        workflow: String,
        node: String,
        calls: Vec<Branch>,
        result: ExecutionResult,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        workflow: String,
        node: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node: String,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

/// Diagnostics emitted by node logic while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Data { key: String, value: Value },
}

/// Event emitter handed to node logic.
///
/// Besides broadcasting, every message is captured so the activation log
/// can report the diagnostic output of that activation.
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node: String,
    sender: broadcast::Sender<ExecutionEvent>,
    captured: Arc<Mutex<Vec<String>>>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node: node.into(),
            sender,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id,
            node: self.node.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        self.capture(message.clone());
        self.emit(NodeEvent::Info { message });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.capture(format!("[warn] {}", message));
        self.emit(NodeEvent::Warning { message });
    }

    /// Publish an intermediate value without recording it as diagnostic output
    pub fn data(&self, key: impl Into<String>, value: Value) {
        self.emit(NodeEvent::Data {
            key: key.into(),
            value,
        });
    }

    /// Record lines produced elsewhere (e.g. by a sandbox worker).
    pub fn capture_all(&self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            self.capture(line);
        }
    }

    /// Drain the captured diagnostic output.
    pub fn take_captured(&self) -> Vec<String> {
        match self.captured.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn capture(&self, line: String) {
        if let Ok(mut lines) = self.captured.lock() {
            lines.push(line);
        }
    }
}

/// Process-wide lifecycle event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Emitting without subscribers is not an error.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node: impl Into<String>) -> EventEmitter {
        EventEmitter::new(execution_id, node, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

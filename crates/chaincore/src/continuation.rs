use crate::Value;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Terminal sentinel ending a workflow successfully.
pub const SUCCESS: &str = "SUCCESS";

/// Terminal sentinel ending a workflow with a failure.
pub const ERROR: &str = "ERROR";

/// Whether `target` names one of the terminal sentinels.
pub fn is_sentinel(target: &str) -> bool {
    target == SUCCESS || target == ERROR
}

/// One recorded continuation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub target: String,
    pub data: Value,
}

impl Branch {
    pub fn new(target: impl Into<String>, data: Value) -> Self {
        Self {
            target: target.into(),
            data,
        }
    }
}

/// Continuation handle given to node logic.
///
/// Calls are only recorded here. The coordinator reads them once the
/// activation has settled and decides what runs next.
#[derive(Debug, Clone, Default)]
pub struct Next {
    calls: Arc<Mutex<Vec<Branch>>>,
}

impl Next {
    pub const SUCCESS: &'static str = SUCCESS;
    pub const ERROR: &'static str = ERROR;

    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition to `target` carrying `data`.
    pub fn call(&self, target: impl Into<String>, data: Value) {
        self.lock().push(Branch::new(target, data));
    }

    pub fn success(&self, data: Value) {
        self.call(SUCCESS, data);
    }

    pub fn error(&self, data: Value) {
        self.call(ERROR, data);
    }

    /// Number of calls recorded so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain the recorded calls in invocation order.
    pub fn take_branches(&self) -> Vec<Branch> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Branch>> {
        // A poisoned collector still holds valid branches.
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

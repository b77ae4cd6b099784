//! Core abstractions for the continuation workflow engine
//!
//! This crate provides the data model every other crate depends on: the
//! validated workflow graph, node logic and its continuation handle, the
//! capability registry, results, lifecycle events and errors. It has no
//! runtime of its own.

mod capability;
mod continuation;
mod error;
pub mod events;
mod node;
mod result;
pub mod value;
mod workflow;

pub use capability::{capability_fn, Capability, CapabilityRegistry, CapabilityTable, FnCapability};
pub use continuation::{is_sentinel, Branch, Next, ERROR, SUCCESS};
pub use error::{
    CapabilityError, ExecutionError, FlowError, NodeError, SandboxError, WorkflowError,
};
pub use events::*;
pub use node::{logic_fn, FnLogic, NodeContext, NodeLogic};
pub use result::ExecutionResult;
pub use value::{json, Value};
pub use workflow::{
    Node, NodeBody, NodeKind, NodeSpec, SandboxSupport, TriggerKind, WorkflowDefinition,
    WorkflowGraph, START,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;

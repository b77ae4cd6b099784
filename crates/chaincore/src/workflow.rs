use crate::{CapabilityRegistry, CapabilityTable, NodeLogic, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Name of the mandatory entry node.
pub const START: &str = "start";

/// How a node is reached from outside the engine.
///
/// Only consumed by front ends (route and schedule registration); the
/// coordinator ignores it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Cron {
        expression: String,
    },
    Interval {
        every_ms: u64,
    },
    #[default]
    Chain,
}

/// Node as supplied by the caller, before validation.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    pub trigger: TriggerKind,
    pub body: NodeBody,
}

#[derive(Clone)]
pub enum NodeBody {
    /// Trusted logic running in-process.
    Native(Arc<dyn NodeLogic>),
    /// Lua chunk run inside the capability sandbox.
    Sandboxed {
        script: Arc<str>,
        capabilities: Vec<String>,
    },
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, logic: impl NodeLogic + 'static) -> Self {
        Self {
            name: name.into(),
            trigger: TriggerKind::default(),
            body: NodeBody::Native(Arc::new(logic)),
        }
    }

    pub fn sandboxed<I, S>(name: impl Into<String>, script: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            trigger: TriggerKind::default(),
            body: NodeBody::Sandboxed {
                script: Arc::from(script.into()),
                capabilities: capabilities.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn is_sandboxed(&self) -> bool {
        matches!(self.body, NodeBody::Sandboxed { .. })
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .field("sandboxed", &self.is_sandboxed())
            .finish()
    }
}

/// Everything needed to build a [`WorkflowGraph`].
#[derive(Clone, Default)]
pub struct WorkflowDefinition {
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub capabilities: CapabilityRegistry,
}

impl WorkflowDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = registry;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Whether the host can run sandboxed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxSupport {
    Available,
    Unavailable,
}

/// Validated node inside a graph.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub trigger: TriggerKind,
    pub kind: NodeKind,
}

#[derive(Clone)]
pub enum NodeKind {
    Native(Arc<dyn NodeLogic>),
    Sandboxed {
        script: Arc<str>,
        capabilities: Arc<CapabilityTable>,
    },
}

impl Node {
    pub fn is_sandboxed(&self) -> bool {
        matches!(self.kind, NodeKind::Sandboxed { .. })
    }
}

/// Immutable, validated workflow.
pub struct WorkflowGraph {
    name: String,
    description: Option<String>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Validate `definition` and build the graph.
    ///
    /// Fails when there are no nodes, a name repeats, there is no `start`
    /// node, a sandboxed node cannot be hosted, or a whitelisted capability
    /// does not resolve in the registry.
    pub fn build(
        name: impl Into<String>,
        definition: WorkflowDefinition,
        support: SandboxSupport,
    ) -> Result<Self, WorkflowError> {
        let name = name.into();
        let WorkflowDefinition {
            description,
            nodes: specs,
            capabilities: registry,
        } = definition;

        if specs.is_empty() {
            return Err(WorkflowError::NoNodes);
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(WorkflowError::DuplicateNode(spec.name.clone()));
            }
        }
        if !seen.contains(START) {
            return Err(WorkflowError::MissingStart);
        }

        let mut nodes = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            let kind = match spec.body {
                NodeBody::Native(logic) => NodeKind::Native(logic),
                NodeBody::Sandboxed {
                    script,
                    capabilities,
                } => {
                    if support == SandboxSupport::Unavailable {
                        return Err(WorkflowError::UnsupportedEnvironment { node: spec.name });
                    }
                    let table = CapabilityTable::resolve(&registry, &capabilities).map_err(
                        |path| WorkflowError::MissingCapability {
                            node: spec.name.clone(),
                            path,
                        },
                    )?;
                    NodeKind::Sandboxed {
                        script,
                        capabilities: Arc::new(table),
                    }
                }
            };
            index.insert(spec.name.clone(), nodes.len());
            nodes.push(Node {
                name: spec.name,
                trigger: spec.trigger,
                kind,
            });
        }

        tracing::debug!("Validated workflow '{}' with {} nodes", name, nodes.len());

        Ok(Self {
            name,
            description,
            nodes,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn has_sandboxed_nodes(&self) -> bool {
        self.nodes.iter().any(Node::is_sandboxed)
    }

    /// Trigger wiring for front ends: `(node name, trigger kind)`.
    pub fn triggers(&self) -> impl Iterator<Item = (&str, &TriggerKind)> {
        self.nodes.iter().map(|n| (n.name.as_str(), &n.trigger))
    }
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field(
                "nodes",
                &self.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

//! Workflows made only of sandboxed script nodes, loaded from JSON files.

use chaincore::{CapabilityRegistry, FlowError, NodeSpec, TriggerKind, WorkflowDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptWorkflow {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<ScriptNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptNode {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerKind,
    /// Inline Lua source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Lua file, relative to the workflow document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_file: Option<PathBuf>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Read a workflow document, inlining every `script_file`.
pub fn load_workflow_file(path: impl AsRef<Path>) -> Result<ScriptWorkflow, FlowError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let mut workflow: ScriptWorkflow = serde_json::from_str(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    for node in &mut workflow.nodes {
        match (&node.script, node.script_file.take()) {
            (Some(_), Some(_)) => {
                return Err(FlowError::Execution(format!(
                    "Node '{}' sets both 'script' and 'script_file'",
                    node.name
                )));
            }
            (Some(_), None) => {}
            (None, Some(file)) => {
                let source = base.join(&file);
                tracing::debug!("Loading script for node '{}' from {}", node.name, source.display());
                node.script = Some(std::fs::read_to_string(&source)?);
            }
            (None, None) => {
                return Err(FlowError::Execution(format!(
                    "Node '{}' has no 'script' or 'script_file'",
                    node.name
                )));
            }
        }
    }

    tracing::info!(
        "Loaded workflow '{}' from {} ({} nodes)",
        workflow.name,
        path.display(),
        workflow.nodes.len()
    );
    Ok(workflow)
}

impl ScriptWorkflow {
    /// Parse a workflow document whose nodes carry inline scripts.
    pub fn from_json(text: &str) -> Result<Self, FlowError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Turn the document into a definition whose capabilities come from `registry`.
    pub fn into_definition(self, registry: CapabilityRegistry) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new().capabilities(registry);
        if let Some(description) = self.description {
            definition = definition.with_description(description);
        }
        for node in self.nodes {
            let script = node.script.unwrap_or_default();
            definition = definition.node(
                NodeSpec::sandboxed(node.name, script, node.capabilities).with_trigger(node.trigger),
            );
        }
        definition
    }
}

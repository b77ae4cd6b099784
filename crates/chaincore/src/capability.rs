//! Named capabilities exposed to sandboxed nodes.
//!
//! The embedding application supplies a [`CapabilityRegistry`]: nested
//! namespaces of callables addressed by dot-paths such as `db.query`. When a
//! workflow is built, each sandboxed node's whitelist is resolved once into
//! a flat [`CapabilityTable`], so activations never walk the registry.

use crate::{CapabilityError, Value};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

/// A callable the host exposes under a dot-path name.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError>;

    /// One-line description for listings.
    fn description(&self) -> &str {
        ""
    }
}

/// Adapter turning an async closure into a [`Capability`].
pub struct FnCapability<F> {
    func: F,
    description: String,
}

impl<F> FnCapability<F> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    async fn invoke(&self, args: Vec<Value>) -> Result<Value, CapabilityError> {
        (self.func)(args).await
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Wrap an async closure as a capability.
pub fn capability_fn<F, Fut>(func: F) -> FnCapability<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CapabilityError>> + Send,
{
    FnCapability {
        func,
        description: String::new(),
    }
}

#[derive(Clone)]
enum Entry {
    Function(Arc<dyn Capability>),
    Namespace(CapabilityRegistry),
}

/// Nested mapping from names to capabilities.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, Entry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `capability` at `path`, creating intermediate namespaces.
    /// An existing entry at the same path is replaced.
    pub fn register(&mut self, path: &str, capability: Arc<dyn Capability>) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let leaf = segments.pop().unwrap_or(path);

        let mut current = self;
        for segment in segments {
            let entry = current
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Entry::Namespace(CapabilityRegistry::new()));
            if let Entry::Function(_) = entry {
                *entry = Entry::Namespace(CapabilityRegistry::new());
            }
            current = match entry {
                Entry::Namespace(namespace) => namespace,
                Entry::Function(_) => unreachable!("function entries were replaced above"),
            };
        }

        tracing::debug!("Registering capability: {}", path);
        current
            .entries
            .insert(leaf.to_string(), Entry::Function(capability));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, path: &str, capability: impl Capability + 'static) -> Self {
        self.register(path, Arc::new(capability));
        self
    }

    /// Mount a whole registry under `name`.
    pub fn namespace(mut self, name: impl Into<String>, registry: CapabilityRegistry) -> Self {
        self.entries.insert(name.into(), Entry::Namespace(registry));
        self
    }

    /// Resolve a dot-path to a callable entry.
    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Capability>> {
        let mut segments = path.split('.').peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            match current.entries.get(segment)? {
                Entry::Function(capability) if segments.peek().is_none() => {
                    return Some(capability.clone());
                }
                Entry::Namespace(namespace) => current = namespace,
                Entry::Function(_) => return None,
            }
        }
        None
    }

    /// Every callable path, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    /// Every callable path with its description, sorted by path.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.paths()
            .into_iter()
            .filter_map(|path| {
                let description = self.resolve(&path)?.description().to_string();
                Some((path, description))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            match entry {
                Entry::Function(_) => out.push(path),
                Entry::Namespace(namespace) => namespace.collect_paths(&path, out),
            }
        }
    }
}

/// Flat, pre-resolved whitelist of one sandboxed node.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    names: Vec<String>,
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityTable {
    /// Resolve every name against `registry`, returning the first path that
    /// does not resolve.
    pub fn resolve(registry: &CapabilityRegistry, names: &[String]) -> Result<Self, String> {
        let mut table = CapabilityTable::default();
        for name in names {
            let capability = registry.resolve(name).ok_or_else(|| name.clone())?;
            if table.entries.insert(name.clone(), capability).is_none() {
                table.names.push(name.clone());
            }
        }
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    /// Whitelisted names in declaration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.names).finish()
    }
}

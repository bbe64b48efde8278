//! Central registry of node types: spec + factory, frozen after startup.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::handler::NodeFactory;
use super::spec::NodeSpec;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown node type '{node_type}'. Known types: {known}")]
    UnknownType { node_type: String, known: String },

    #[error("node type '{0}' registered twice")]
    DuplicateType(String),

    #[error("catalog entry '{0}' has no registered factory")]
    MissingFactory(String),

    #[error("failed to read catalog {path}: {source}")]
    CatalogRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {path}: {source}")]
    CatalogParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One registered node type.
#[derive(Clone)]
pub struct RegistryEntry {
    pub spec: NodeSpec,
    pub factory: Arc<dyn NodeFactory>,
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Immutable catalog of node types. Built once at startup via
/// [`RegistryBuilder`]; lookups are lock-free afterwards.
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: Vec::new(),
        }
    }

    /// Resolve a node type to its spec and factory.
    pub fn lookup(&self, node_type: &str) -> Result<&RegistryEntry, CatalogError> {
        self.entries
            .get(node_type)
            .ok_or_else(|| CatalogError::UnknownType {
                node_type: node_type.to_string(),
                known: self.known_types().join(", "),
            })
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    /// All registered specs, sorted by type for deterministic listings.
    pub fn list(&self) -> Vec<&NodeSpec> {
        let mut specs: Vec<&NodeSpec> = self.entries.values().map(|e| &e.spec).collect();
        specs.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        specs
    }

    /// All known type identifiers, sorted.
    pub fn known_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Accumulates registrations, then freezes them into a [`NodeRegistry`].
pub struct RegistryBuilder {
    entries: Vec<RegistryEntry>,
}

impl RegistryBuilder {
    /// Register a node type with its spec and executor factory.
    pub fn register(mut self, spec: NodeSpec, factory: Arc<dyn NodeFactory>) -> Self {
        self.entries.push(RegistryEntry { spec, factory });
        self
    }

    /// Overlay declarative catalog specs onto already-registered types.
    ///
    /// A catalog entry replaces the registered spec of the same type; an
    /// entry naming a type without a factory is a startup error.
    pub fn overlay(mut self, specs: Vec<NodeSpec>) -> Result<Self, CatalogError> {
        for spec in specs {
            let slot = self
                .entries
                .iter_mut()
                .find(|e| e.spec.node_type == spec.node_type)
                .ok_or_else(|| CatalogError::MissingFactory(spec.node_type.clone()))?;
            slot.spec = spec;
        }
        Ok(self)
    }

    /// Freeze the registry. Duplicate registration of a type is an error.
    pub fn build(self) -> Result<NodeRegistry, CatalogError> {
        let mut entries = HashMap::with_capacity(self.entries.len());
        for entry in self.entries {
            let key = entry.spec.node_type.clone();
            if entries.insert(key.clone(), entry).is_some() {
                return Err(CatalogError::DuplicateType(key));
            }
        }
        Ok(NodeRegistry { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::handler::{ExecutionContext, NodeError, NodeHandler};
    use crate::catalog::spec::{OutputField, ParamKind, ParamSpec};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopHandler;

    #[async_trait]
    impl NodeHandler for NoopHandler {
        async fn run(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
            Ok(serde_json::json!({}))
        }
    }

    struct NoopFactory;

    impl NodeFactory for NoopFactory {
        fn create(&self) -> Box<dyn NodeHandler> {
            Box::new(NoopHandler)
        }
    }

    fn spec(node_type: &str) -> NodeSpec {
        NodeSpec {
            node_type: node_type.to_string(),
            name: node_type.to_uppercase(),
            description: String::new(),
            outputs: vec![OutputField::new("result", "")],
            params: vec![ParamSpec::required("value", ParamKind::Any, "")],
            retryable: false,
            default_timeout_secs: 60,
            isolated: false,
        }
    }

    #[test]
    fn lookup_known_type_succeeds() {
        let reg = NodeRegistry::builder()
            .register(spec("echo"), Arc::new(NoopFactory))
            .build()
            .unwrap();
        let entry = reg.lookup("echo").unwrap();
        assert_eq!(entry.spec.node_type, "echo");
    }

    #[test]
    fn lookup_unknown_type_lists_known() {
        let reg = NodeRegistry::builder()
            .register(spec("add"), Arc::new(NoopFactory))
            .register(spec("echo"), Arc::new(NoopFactory))
            .build()
            .unwrap();
        let err = reg.lookup("bogus").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownType { .. }));
        assert!(err.to_string().contains("add, echo"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = NodeRegistry::builder()
            .register(spec("echo"), Arc::new(NoopFactory))
            .register(spec("echo"), Arc::new(NoopFactory))
            .build();
        let err = result.err().unwrap();
        assert!(matches!(err, CatalogError::DuplicateType(t) if t == "echo"));
    }

    #[test]
    fn overlay_replaces_spec_for_registered_type() {
        let mut replacement = spec("echo");
        replacement.description = "from catalog file".to_string();
        replacement.retryable = true;

        let reg = NodeRegistry::builder()
            .register(spec("echo"), Arc::new(NoopFactory))
            .overlay(vec![replacement])
            .unwrap()
            .build()
            .unwrap();

        let entry = reg.lookup("echo").unwrap();
        assert_eq!(entry.spec.description, "from catalog file");
        assert!(entry.spec.retryable);
    }

    #[test]
    fn overlay_without_factory_is_an_error() {
        let result = NodeRegistry::builder()
            .register(spec("echo"), Arc::new(NoopFactory))
            .overlay(vec![spec("crawler")]);
        let err = result.err().unwrap();
        assert!(matches!(err, CatalogError::MissingFactory(t) if t == "crawler"));
    }

    #[test]
    fn list_is_sorted_by_type() {
        let reg = NodeRegistry::builder()
            .register(spec("multiply"), Arc::new(NoopFactory))
            .register(spec("add"), Arc::new(NoopFactory))
            .register(spec("echo"), Arc::new(NoopFactory))
            .build()
            .unwrap();
        let types: Vec<&str> = reg.list().iter().map(|s| s.node_type.as_str()).collect();
        assert_eq!(types, vec!["add", "echo", "multiply"]);
    }
}

//! Per-run output store: node id -> completed output object.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A node id was written twice within one run.
    #[error("output for node '{0}' already written")]
    DuplicateWrite(String),
}

/// Shared mapping from node id to that node's completed output.
///
/// A given id is written at most once per run, by the worker that owns the
/// node; downstream readers observe the write because their readiness is
/// gated on the writer's terminal event.
#[derive(Debug, Default)]
pub struct OutputStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's output. Rejects a second write for the same id.
    pub fn insert(&self, node_id: &str, output: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("output store lock poisoned");
        if entries.contains_key(node_id) {
            return Err(StoreError::DuplicateWrite(node_id.to_string()));
        }
        entries.insert(node_id.to_string(), output);
        Ok(())
    }

    /// Owned copy of a node's output, if present.
    pub fn get(&self, node_id: &str) -> Option<Value> {
        self.entries
            .read()
            .expect("output store lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries
            .read()
            .expect("output store lock poisoned")
            .contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("output store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

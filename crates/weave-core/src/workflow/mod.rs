//! Workflow documents and their validated, normalized form.

pub mod validator;

pub use validator::{validate, validate_in_loop_scope, ValidationError};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved reference root bound inside loop subgraphs (`$loop.item` etc.).
pub const LOOP_CONTEXT_ID: &str = "loop";

/// Catalog type identifier of the loop node.
pub const LOOP_NODE_TYPE: &str = "loop";

/// A node as written in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Directed dependency edge: `from` runs before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Raw workflow document as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Validated workflow: normalized nodes, the full edge set (including edges
/// inferred from references), and a topological rank per node.
///
/// The rank is the ready-queue tie-break, not the execution order; the
/// scheduler launches any node whose predecessors have all completed.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<Edge>,
    topo_rank: HashMap<String, usize>,
}

impl Workflow {
    pub(crate) fn new(
        nodes: Vec<WorkflowNode>,
        edges: Vec<Edge>,
        topo_rank: HashMap<String, usize>,
    ) -> Self {
        Self {
            nodes,
            edges,
            topo_rank,
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Topological rank of a node; lower ranks launch first among ready nodes.
    pub fn rank(&self, id: &str) -> usize {
        self.topo_rank.get(id).copied().unwrap_or(usize::MAX)
    }

    /// Node ids sorted by topological rank.
    pub fn topo_order(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        ids.sort_by_key(|id| self.rank(id));
        ids
    }

    /// Direct successors of a node.
    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Direct predecessors of a node.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_parses_wire_format() {
        let doc: WorkflowDocument = serde_json::from_value(json!({
            "nodes": [
                {"id": "a", "type": "add", "params": {"num1": 10, "num2": 20}},
                {"id": "b", "type": "multiply", "params": {"num1": "$a.result", "num2": 2}}
            ],
            "edges": [{"from": "a", "to": "b"}]
        }))
        .unwrap();

        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[1].node_type, "multiply");
        assert_eq!(doc.edges, vec![Edge::new("a", "b")]);
    }

    #[test]
    fn params_default_to_empty() {
        let doc: WorkflowDocument =
            serde_json::from_value(json!({"nodes": [{"id": "a", "type": "echo"}]})).unwrap();
        assert!(doc.nodes[0].params.is_empty());
        assert!(doc.edges.is_empty());
    }
}

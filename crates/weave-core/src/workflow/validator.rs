//! Workflow document validation and normalization.
//!
//! Validation is fatal: no executor runs for a document that fails any
//! step. The output is a [`Workflow`] whose edge set includes edges
//! inferred from parameter references and whose nodes carry materialized
//! defaults.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::{Edge, Workflow, WorkflowDocument, WorkflowNode, LOOP_CONTEXT_ID};
use crate::catalog::{NodeRegistry, ParamKind};
use crate::reference::{referenced_ids, Reference};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("node id '{0}' is not a valid identifier")]
    InvalidNodeId(String),

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("node '{node_id}': unknown node type '{node_type}'. Known types: {known}")]
    UnknownNodeType {
        node_id: String,
        node_type: String,
        known: String,
    },

    #[error("edge {from}->{to} references unknown node '{unknown}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        unknown: String,
    },

    #[error("node '{node_id}': missing required param '{param}'")]
    MissingParam { node_id: String, param: String },

    #[error("node '{node_id}': unknown param '{param}'")]
    UnknownParam { node_id: String, param: String },

    #[error("node '{node_id}': param '{param}' is not coercible to {expected}: {value}")]
    ParamType {
        node_id: String,
        param: String,
        expected: &'static str,
        value: String,
    },

    #[error("node '{node_id}': reference '{expr}' names unknown node '{root}'")]
    UnknownReference {
        node_id: String,
        expr: String,
        root: String,
    },

    #[error("workflow contains a dependency cycle involving: {}", members.join(", "))]
    Cycle { members: Vec<String> },
}

/// Validate a workflow document against the registry.
pub fn validate(registry: &NodeRegistry, doc: &WorkflowDocument) -> Result<Workflow, ValidationError> {
    run_validation(registry, doc, false)
}

/// Validate a nested loop-subgraph document; references rooted at the
/// reserved `loop` id are accepted.
pub fn validate_in_loop_scope(
    registry: &NodeRegistry,
    doc: &WorkflowDocument,
) -> Result<Workflow, ValidationError> {
    run_validation(registry, doc, true)
}

fn run_validation(
    registry: &NodeRegistry,
    doc: &WorkflowDocument,
    loop_scope: bool,
) -> Result<Workflow, ValidationError> {
    // Shape: non-empty, unique well-formed ids, known types.
    if doc.nodes.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut ids = HashSet::new();
    for node in &doc.nodes {
        if !is_identifier(&node.id) {
            return Err(ValidationError::InvalidNodeId(node.id.clone()));
        }
        if node.id == LOOP_CONTEXT_ID {
            return Err(ValidationError::ReservedNodeId(node.id.clone()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        if !registry.contains(&node.node_type) {
            return Err(ValidationError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                known: registry.known_types().join(", "),
            });
        }
    }

    for edge in &doc.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                return Err(ValidationError::UnknownEdgeEndpoint {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    unknown: endpoint.clone(),
                });
            }
        }
    }

    // Params: presence, defaults, lenient coercion of literals.
    let mut nodes = doc.nodes.clone();
    for node in &mut nodes {
        let spec = &registry
            .lookup(&node.node_type)
            .expect("type checked above")
            .spec;

        for name in node.params.keys() {
            if name != "timeout" && spec.param(name).is_none() {
                return Err(ValidationError::UnknownParam {
                    node_id: node.id.clone(),
                    param: name.clone(),
                });
            }
        }

        for param in &spec.params {
            match node.params.get(&param.name) {
                Some(value) => {
                    // References and containers holding references are
                    // kind-checked at resolution time.
                    if contains_reference(value) {
                        continue;
                    }
                    let coerced = coerce(value, param.kind).ok_or_else(|| {
                        ValidationError::ParamType {
                            node_id: node.id.clone(),
                            param: param.name.clone(),
                            expected: param.kind.as_str(),
                            value: value.to_string(),
                        }
                    })?;
                    node.params.insert(param.name.clone(), coerced);
                }
                None if param.required => {
                    return Err(ValidationError::MissingParam {
                        node_id: node.id.clone(),
                        param: param.name.clone(),
                    });
                }
                None => {
                    if let Some(default) = &param.default {
                        node.params.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        if let Some(timeout) = node.params.get("timeout") {
            if !contains_reference(timeout) && coerce(timeout, ParamKind::Integer).is_none() {
                return Err(ValidationError::ParamType {
                    node_id: node.id.clone(),
                    param: "timeout".to_string(),
                    expected: "integer",
                    value: timeout.to_string(),
                });
            }
        }
    }

    // Reference soundness + implicit edge inference.
    let mut edges: Vec<Edge> = Vec::new();
    let mut edge_set: HashSet<Edge> = HashSet::new();
    for edge in &doc.edges {
        if edge_set.insert(edge.clone()) {
            edges.push(edge.clone());
        }
    }

    for node in &nodes {
        let mut roots = Vec::new();
        referenced_ids(&Value::Object(node.params.clone()), &mut roots);
        for root in roots {
            if root == LOOP_CONTEXT_ID {
                if loop_scope {
                    continue;
                }
                return Err(ValidationError::UnknownReference {
                    node_id: node.id.clone(),
                    expr: format!("${root}"),
                    root,
                });
            }
            if !ids.contains(root.as_str()) {
                return Err(ValidationError::UnknownReference {
                    node_id: node.id.clone(),
                    expr: format!("${root}"),
                    root,
                });
            }
            let inferred = Edge::new(&root, &node.id);
            if edge_set.insert(inferred.clone()) {
                debug!(from = %root, to = %node.id, "inferred edge from reference");
                edges.push(inferred);
            }
        }
    }

    // Cycle check via Kahn's algorithm; queue kept sorted for determinism.
    let topo_rank = topo_sort(&nodes, &edges)?;

    Ok(Workflow::new(nodes, edges, topo_rank))
}

fn topo_sort(
    nodes: &[WorkflowNode],
    edges: &[Edge],
) -> Result<HashMap<String, usize>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        nodes.iter().map(|n| (n.id.as_str(), Vec::new())).collect();

    for edge in edges {
        *in_degree.get_mut(edge.to.as_str()).expect("endpoint checked") += 1;
        dependents
            .get_mut(edge.from.as_str())
            .expect("endpoint checked")
            .push(&edge.to);
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    queue.sort_unstable();

    let mut rank = HashMap::with_capacity(nodes.len());
    while let Some(id) = queue.first().copied() {
        queue.remove(0);
        rank.insert(id.to_string(), rank.len());

        for &dep in &dependents[id] {
            let deg = in_degree.get_mut(dep).expect("endpoint checked");
            *deg -= 1;
            if *deg == 0 {
                let pos = queue.partition_point(|&q| q < dep);
                queue.insert(pos, dep);
            }
        }
    }

    if rank.len() != nodes.len() {
        let mut members: Vec<String> = nodes
            .iter()
            .map(|n| n.id.clone())
            .filter(|id| !rank.contains_key(id))
            .collect();
        members.sort_unstable();
        return Err(ValidationError::Cycle { members });
    }

    Ok(rank)
}

fn is_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => Reference::parse(s).is_some(),
        Value::Array(items) => items.iter().any(contains_reference),
        Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

/// Lenient coercion of a literal to a declared param kind.
fn coerce(value: &Value, kind: ParamKind) -> Option<Value> {
    match kind {
        ParamKind::Any => Some(value.clone()),
        ParamKind::String => value.as_str().map(|s| Value::String(s.to_string())),
        ParamKind::Integer => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::from(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0)
                        .map(|f| Value::from(f as i64))
                }
            }
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ParamKind::Float => match value {
            Value::Number(_) => Some(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            _ => None,
        },
        ParamKind::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParamKind::Mapping => match value {
            Value::Object(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
        ParamKind::Sequence | ParamKind::Tuple => match value {
            Value::Array(_) => Some(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Some(parsed),
                _ => None,
            },
            _ => None,
        },
    }
}

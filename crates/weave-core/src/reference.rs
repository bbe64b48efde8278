//! Reference expressions: `$nodeId.field[0].more[*]` values resolved
//! against the run's output store.
//!
//! A parameter value is a reference iff it is a string matching the grammar
//! from position 0; anything else is a literal and passes through
//! untouched. Resolution is eager and returns owned values, so an upstream
//! retry can never race a downstream parameter frame.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::runtime::OutputStore;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference '{expr}': unknown node '{node_id}'")]
    UnknownNode { expr: String, node_id: String },

    #[error("reference '{expr}': missing field '{field}'")]
    MissingField { expr: String, field: String },

    #[error("reference '{expr}': field '{field}' accessed on a non-mapping value")]
    NotAMapping { expr: String, field: String },

    #[error("reference '{expr}': index {index} out of range (len {len})")]
    IndexOutOfRange {
        expr: String,
        index: usize,
        len: usize,
    },

    #[error("reference '{expr}': index or wildcard applied to a non-sequence value")]
    NotASequence { expr: String },
}

/// One path step after the node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// A parsed reference expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub node_id: String,
    pub path: Vec<Segment>,
    expr: String,
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*|\[(?:\d+|\*)\])*$")
            .expect("reference pattern is valid")
    })
}

impl Reference {
    /// Parse a string as a reference. Returns `None` for literals.
    pub fn parse(raw: &str) -> Option<Self> {
        if !reference_pattern().is_match(raw) {
            return None;
        }

        // The regex guarantees shape; this scanner just splits segments.
        let body = &raw[1..];
        let id_end = body.find(['.', '[']).unwrap_or(body.len());
        let node_id = body[..id_end].to_string();

        let mut path = Vec::new();
        let mut rest = &body[id_end..];
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('.') {
                let end = stripped
                    .find(['.', '['])
                    .unwrap_or(stripped.len());
                path.push(Segment::Field(stripped[..end].to_string()));
                rest = &stripped[end..];
            } else {
                // '[' ... ']'
                let close = rest.find(']').expect("regex guarantees closing bracket");
                let inner = &rest[1..close];
                if inner == "*" {
                    path.push(Segment::Wildcard);
                } else {
                    // Oversized literal indices fail resolution as out-of-range.
                    let index = inner.parse::<usize>().unwrap_or(usize::MAX);
                    path.push(Segment::Index(index));
                }
                rest = &rest[close + 1..];
            }
        }

        Some(Self {
            node_id,
            path,
            expr: raw.to_string(),
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Evaluate this reference against the output store.
    pub fn resolve(&self, store: &OutputStore) -> Result<Value, ReferenceError> {
        let root = store
            .get(&self.node_id)
            .ok_or_else(|| ReferenceError::UnknownNode {
                expr: self.expr.clone(),
                node_id: self.node_id.clone(),
            })?;
        let (value, _) = walk(&root, &self.path, &self.expr)?;
        Ok(value)
    }
}

/// Walk the remaining path. The boolean marks a wildcard projection, so an
/// enclosing wildcard knows to splice (flatten one level) instead of nest.
fn walk(value: &Value, path: &[Segment], expr: &str) -> Result<(Value, bool), ReferenceError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok((value.clone(), false));
    };

    match head {
        Segment::Field(field) => match value {
            Value::Object(map) => match map.get(field) {
                Some(child) => walk(child, rest, expr),
                None => Err(ReferenceError::MissingField {
                    expr: expr.to_string(),
                    field: field.clone(),
                }),
            },
            _ => Err(ReferenceError::NotAMapping {
                expr: expr.to_string(),
                field: field.clone(),
            }),
        },
        Segment::Index(index) => match value {
            Value::Array(items) => match items.get(*index) {
                Some(child) => walk(child, rest, expr),
                None => Err(ReferenceError::IndexOutOfRange {
                    expr: expr.to_string(),
                    index: *index,
                    len: items.len(),
                }),
            },
            _ => Err(ReferenceError::NotASequence {
                expr: expr.to_string(),
            }),
        },
        Segment::Wildcard => {
            let items = value.as_array().ok_or_else(|| ReferenceError::NotASequence {
                expr: expr.to_string(),
            })?;
            let mut collected = Vec::with_capacity(items.len());
            for item in items {
                let (resolved, projected) = walk(item, rest, expr)?;
                if projected {
                    // One-level flat-map per `[*]`.
                    match resolved {
                        Value::Array(inner) => collected.extend(inner),
                        other => collected.push(other),
                    }
                } else {
                    collected.push(resolved);
                }
            }
            Ok((Value::Array(collected), true))
        }
    }
}

/// Resolve a parameter value: reference strings are evaluated, mappings and
/// sequences are resolved recursively, everything else passes through.
pub fn resolve_value(value: &Value, store: &OutputStore) -> Result<Value, ReferenceError> {
    match value {
        Value::String(s) => match Reference::parse(s) {
            Some(reference) => reference.resolve(store),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, store))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, store)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

/// Collect the distinct node ids referenced anywhere inside a value.
pub fn referenced_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(reference) = Reference::parse(s) {
                if !out.contains(&reference.node_id) {
                    out.push(reference.node_id);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                referenced_ids(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                referenced_ids(item, out);
            }
        }
        _ => {}
    }
}

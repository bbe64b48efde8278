//! Catalog entry types: what a node *type* declares about itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared kind of a node parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    Mapping,
    Sequence,
    Tuple,
    Any,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Float => "float",
            ParamKind::Boolean => "boolean",
            ParamKind::Mapping => "mapping",
            ParamKind::Sequence => "sequence",
            ParamKind::Tuple => "tuple",
            ParamKind::Any => "any",
        }
    }
}

/// One declared parameter of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub doc: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind, doc: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            default: None,
            doc: doc.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, default: Option<Value>, doc: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            default,
            doc: doc.to_string(),
        }
    }
}

/// One declared output field of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    #[serde(default)]
    pub doc: String,
}

impl OutputField {
    pub fn new(name: &str, doc: &str) -> Self {
        Self {
            name: name.to_string(),
            doc: doc.to_string(),
        }
    }
}

/// Immutable catalog entry describing a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Stable string identifier, unique across the catalog.
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub outputs: Vec<OutputField>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Whether transient failures of this type are retried.
    #[serde(default)]
    pub retryable: bool,
    /// Timeout applied when the node provides no `timeout` param.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Runs in an isolated worker and is hard-killed on timeout.
    #[serde(default)]
    pub isolated: bool,
}

fn default_timeout_secs() -> u64 {
    60
}

impl NodeSpec {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_deserializes_from_catalog_json() {
        let spec: NodeSpec = serde_json::from_str(
            r#"{
                "type": "add",
                "name": "Add",
                "description": "Adds two numbers",
                "outputs": [{"name": "result", "doc": "the sum"}],
                "params": [
                    {"name": "num1", "kind": "float", "required": true},
                    {"name": "num2", "kind": "float", "required": true}
                ],
                "retryable": false
            }"#,
        )
        .unwrap();

        assert_eq!(spec.node_type, "add");
        assert_eq!(spec.outputs.len(), 1);
        assert_eq!(spec.params.len(), 2);
        assert!(spec.param("num1").unwrap().required);
        assert_eq!(spec.default_timeout_secs, 60);
        assert!(!spec.isolated);
    }

    #[test]
    fn param_kind_round_trips() {
        for kind in [
            ParamKind::String,
            ParamKind::Integer,
            ParamKind::Float,
            ParamKind::Boolean,
            ParamKind::Mapping,
            ParamKind::Sequence,
            ParamKind::Tuple,
            ParamKind::Any,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ParamKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}

//! Declarative catalog file loading.
//!
//! A catalog file is a JSON array of node spec entries. The core reads the
//! catalog and overlays it onto registered factories at startup; it does
//! not define leaf node implementations.

use std::path::Path;

use tracing::info;

use super::registry::CatalogError;
use super::spec::NodeSpec;

/// Parse a catalog document from a JSON string.
pub fn parse_catalog(json: &str) -> Result<Vec<NodeSpec>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Load a catalog file from disk.
pub fn load_catalog(path: &Path) -> Result<Vec<NodeSpec>, CatalogError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::CatalogRead {
        path: path.display().to_string(),
        source,
    })?;
    let specs = parse_catalog(&contents).map_err(|source| CatalogError::CatalogParse {
        path: path.display().to_string(),
        source,
    })?;
    info!(
        path = %path.display(),
        entries = specs.len(),
        "loaded node catalog"
    );
    Ok(specs)
}

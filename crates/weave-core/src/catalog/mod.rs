//! Node catalog: type specs, the executor contract, and the registry.

pub mod builtin;
pub mod handler;
pub mod loader;
pub mod registry;
pub mod spec;

pub use handler::{
    ExecutionContext, FnFactory, NodeError, NodeErrorKind, NodeFactory, NodeHandler, ProgressSink,
};
pub use loader::{load_catalog, parse_catalog};
pub use registry::{CatalogError, NodeRegistry, RegistryBuilder, RegistryEntry};
pub use spec::{NodeSpec, OutputField, ParamKind, ParamSpec};

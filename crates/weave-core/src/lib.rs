//! weave-core: a DAG workflow runtime.
//!
//! Workflows are validated against a node catalog, scheduled with
//! dependency-aware concurrency, and streamed as ordered per-session
//! events. A loop node expands a nested workflow per input element, and
//! agent mode drives the same catalog through a bounded reason-act cycle.

pub mod agent;
pub mod callback;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod reference;
pub mod runtime;
pub mod session;
pub mod workflow;

pub use error::{Result, WeaveError};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("weave tracing initialised");
}

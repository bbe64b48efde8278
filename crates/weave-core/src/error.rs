use thiserror::Error;

/// Top-level error type for the weave-core library.
#[derive(Debug, Error)]
pub enum WeaveError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Node catalog registration or lookup error.
    #[error(transparent)]
    Catalog(#[from] crate::catalog::CatalogError),

    /// Workflow document validation error.
    #[error(transparent)]
    Validation(#[from] crate::workflow::ValidationError),

    /// Reference expression resolution error.
    #[error(transparent)]
    Reference(#[from] crate::reference::ReferenceError),

    /// Session bus error.
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    /// Agent loop error.
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse or serialize error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WeaveError>;

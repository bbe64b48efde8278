use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{Result, WeaveError};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaveConfig {
    pub general: GeneralConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
}

impl WeaveConfig {
    /// Load config from a specific `weave.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WeaveError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| WeaveError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./weave.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("weave.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load weave.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.general.max_workers == 0 {
            return Err(WeaveError::Config("general.max_workers must be > 0".into()));
        }
        if self.general.default_timeout_seconds == 0 {
            return Err(WeaveError::Config(
                "general.default_timeout_seconds must be > 0".into(),
            ));
        }
        if self.general.retry_max_attempts == 0 {
            return Err(WeaveError::Config(
                "general.retry_max_attempts must be >= 1".into(),
            ));
        }
        if self.general.retry_base_ms == 0 {
            return Err(WeaveError::Config("general.retry_base_ms must be > 0".into()));
        }
        if self.session.queue_capacity == 0 {
            return Err(WeaveError::Config(
                "session.queue_capacity must be > 0".into(),
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(WeaveError::Config("agent.max_iterations must be > 0".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Upper bound on concurrently executing nodes per run.
    pub max_workers: usize,
    /// Timeout applied to a node whose type declares no default.
    pub default_timeout_seconds: u64,
    /// Base delay for exponential back-off between retries, in milliseconds.
    pub retry_base_ms: u64,
    /// Total attempts for a retriable node (first try included).
    pub retry_max_attempts: u32,
    /// When a node fails, let already-running independent nodes finish
    /// instead of cancelling them.
    pub let_running_finish: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            default_timeout_seconds: 60,
            retry_base_ms: 500,
            retry_max_attempts: 3,
            let_running_finish: true,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded per-subscriber event queue capacity.
    pub queue_capacity: usize,
    /// Grace period before a drained session is removed, in seconds.
    pub close_grace_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            close_grace_seconds: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Iteration budget for the reason-act loop.
    pub max_iterations: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

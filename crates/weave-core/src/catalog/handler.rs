//! The `NodeHandler` trait: the contract every node executor must fulfil.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Classification of a node execution failure.
///
/// Only `TransientIo` is eligible for retry, and only when the node's
/// catalog entry is marked retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    Validation,
    Resolution,
    Timeout,
    TransientIo,
    PermanentIo,
    ExecutorBug,
    Cancelled,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeErrorKind::Validation => "validation",
            NodeErrorKind::Resolution => "resolution",
            NodeErrorKind::Timeout => "timeout",
            NodeErrorKind::TransientIo => "transient_io",
            NodeErrorKind::PermanentIo => "permanent_io",
            NodeErrorKind::ExecutorBug => "executor_bug",
            NodeErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Error returned by a node's `run` method.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Transient failure; the executor may re-try.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::TransientIo, message)
    }

    /// Permanent failure; no retry is attempted.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::PermanentIo, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Validation, message)
    }

    pub fn executor_bug(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::ExecutorBug, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == NodeErrorKind::TransientIo
    }
}

/// Sink for intermediate progress updates, republished as `tool_progress`
/// events by the executor.
pub type ProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Per-invocation context handed to a node handler.
pub struct ExecutionContext {
    /// ID of the node being executed.
    pub node_id: String,
    /// ID of the enclosing run.
    pub run_id: Uuid,
    /// Loop iteration index when inside a loop subgraph.
    pub iteration: Option<usize>,
    /// Cooperative cancellation signal; long handlers should check it.
    pub cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl ExecutionContext {
    pub fn new(
        node_id: &str,
        run_id: Uuid,
        iteration: Option<usize>,
        cancel: CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            run_id,
            iteration,
            cancel,
            progress,
        }
    }

    /// Context without progress reporting, for direct handler invocation.
    pub fn detached(node_id: &str) -> Self {
        Self::new(node_id, Uuid::new_v4(), None, CancellationToken::new(), None)
    }

    /// Emit an intermediate progress update.
    pub fn progress(&self, data: Value) {
        if let Some(sink) = &self.progress {
            sink(data);
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("node_id", &self.node_id)
            .field("run_id", &self.run_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// The core node executor trait.
///
/// `run` receives the node's fully resolved parameters and returns the
/// node's output object. The factory creates one handler per node
/// execution; retries reuse the same instance.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn run(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, NodeError>;
}

/// Produces a fresh handler instance per node execution.
pub trait NodeFactory: Send + Sync {
    fn create(&self) -> Box<dyn NodeHandler>;
}

/// Adapter so plain closures can serve as factories.
pub struct FnFactory<F>(pub F);

impl<F> NodeFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn NodeHandler> + Send + Sync,
{
    fn create(&self) -> Box<dyn NodeHandler> {
        (self.0)()
    }
}

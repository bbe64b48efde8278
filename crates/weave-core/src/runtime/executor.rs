//! Node executor: runs one workflow node with parameter resolution,
//! timeout, retry, cancellation, and lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::OutputStore;
use crate::callback::RunCallbacks;
use crate::catalog::{ExecutionContext, NodeError, NodeErrorKind, ProgressSink, RegistryEntry};
use crate::config::GeneralConfig;
use crate::event::NodeRecord;
use crate::reference::resolve_value;
use crate::workflow::WorkflowNode;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential back-off with jitter for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(general: &GeneralConfig) -> Self {
        Self {
            base: Duration::from_millis(general.retry_base_ms),
            max_attempts: general.retry_max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-based), jittered.
    fn delay(&self, retry: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(retry.saturating_sub(1) as i32);
        let jitter = 1.0 + self.jitter * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64(exp * jitter)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

enum Attempt {
    Success(Value),
    Failed(NodeError),
    TimedOut(u64),
    Cancelled,
}

/// Run one node to a terminal record.
///
/// Emits `node_result{running}` before invoking the handler and exactly one
/// terminal `node_result`; writes the output store iff the node completes.
/// Parameter resolution failures never invoke the handler.
pub async fn execute_node(
    node: &WorkflowNode,
    entry: &RegistryEntry,
    store: &Arc<OutputStore>,
    callbacks: &Arc<RunCallbacks>,
    retry: &RetryPolicy,
    fallback_timeout: Duration,
    cancel: CancellationToken,
    iteration: Option<usize>,
) -> NodeRecord {
    let started_at = chrono::Utc::now();

    // Eager resolution into an owned parameter frame.
    let params = match resolve_value(&Value::Object(node.params.clone()), store) {
        Ok(params) => params,
        Err(e) => {
            let error = NodeError::new(NodeErrorKind::Resolution, e.to_string());
            let mut record = NodeRecord::failed(&node.id, error.to_string(), iteration);
            record.started_at = started_at;
            callbacks.node_result(&record);
            return record;
        }
    };

    let timeout = node_timeout(&params, entry, fallback_timeout);

    let mut running = NodeRecord::running(&node.id, iteration);
    running.started_at = started_at;
    callbacks.node_result(&running);

    let handler = entry.factory.create();
    let progress: ProgressSink = {
        let callbacks = Arc::clone(callbacks);
        let node_id = node.id.clone();
        Arc::new(move |data| callbacks.tool_progress(&node_id, data))
    };
    let ctx = ExecutionContext::new(
        &node.id,
        callbacks.run_id(),
        iteration,
        cancel.child_token(),
        Some(progress),
    );

    let max_retries = retry.max_attempts.saturating_sub(1);
    let mut retries = 0u32;

    let mut record = loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => Attempt::Cancelled,
            outcome = tokio::time::timeout(timeout, handler.run(params.clone(), &ctx)) => {
                match outcome {
                    Ok(Ok(data)) => Attempt::Success(data),
                    Ok(Err(e)) => Attempt::Failed(e),
                    Err(_) => Attempt::TimedOut(timeout.as_secs()),
                }
            }
        };

        match attempt {
            Attempt::Success(data) => {
                if let Err(e) = store.insert(&node.id, data.clone()) {
                    // Single writer per id; a duplicate means a scheduler bug.
                    let error = NodeError::executor_bug(e.to_string());
                    break NodeRecord::failed(&node.id, error.to_string(), iteration);
                }
                break NodeRecord::completed(&node.id, data, iteration);
            }
            Attempt::Cancelled => {
                debug!(node_id = %node.id, "node cancelled");
                break NodeRecord::cancelled(&node.id, iteration);
            }
            Attempt::TimedOut(secs) => {
                warn!(node_id = %node.id, timeout_secs = secs, "node timed out");
                let error = NodeError::new(
                    NodeErrorKind::Timeout,
                    format!("timed out after {secs}s"),
                );
                break NodeRecord::failed(&node.id, error.to_string(), iteration);
            }
            Attempt::Failed(e) => {
                if e.is_transient() && entry.spec.retryable && retries < max_retries {
                    retries += 1;
                    callbacks.tool_retry(&node.id, retries, max_retries, &e.to_string());
                    debug!(
                        node_id = %node.id,
                        attempt = retries,
                        max_retries,
                        "retrying transient failure"
                    );
                    tokio::time::sleep(retry.delay(retries)).await;
                    continue;
                }
                break NodeRecord::failed(&node.id, e.to_string(), iteration);
            }
        }
    };

    record.started_at = started_at;
    callbacks.node_result(&record);
    record
}

/// Per-node timeout: `params.timeout` wins, then the catalog default, then
/// the configured fallback (a catalog default of 0 defers to the config).
fn node_timeout(params: &Value, entry: &RegistryEntry, fallback: Duration) -> Duration {
    if let Some(secs) = params.get("timeout").and_then(Value::as_u64) {
        if secs > 0 {
            return Duration::from_secs(secs);
        }
    }
    if entry.spec.default_timeout_secs > 0 {
        return Duration::from_secs(entry.spec.default_timeout_secs);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FnFactory, NodeFactory, NodeHandler, NodeSpec, OutputField, ParamKind, ParamSpec};
    use crate::event::{Event, EventKind, NodeStatus};
    use crate::session::SessionBus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn entry(spec: NodeSpec, factory: Arc<dyn NodeFactory>) -> RegistryEntry {
        RegistryEntry { spec, factory }
    }

    fn spec(node_type: &str, retryable: bool) -> NodeSpec {
        NodeSpec {
            node_type: node_type.to_string(),
            name: node_type.to_string(),
            description: String::new(),
            outputs: vec![OutputField::new("result", "")],
            params: vec![ParamSpec::optional("value", ParamKind::Any, None, "")],
            retryable,
            default_timeout_secs: 60,
            isolated: false,
        }
    }

    fn node(id: &str, node_type: &str, params: Value) -> WorkflowNode {
        serde_json::from_value(json!({"id": id, "type": node_type, "params": params})).unwrap()
    }

    fn harness() -> (Arc<SessionBus>, Arc<RunCallbacks>, Arc<OutputStore>) {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("s").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "s"));
        (bus, callbacks, Arc::new(OutputStore::new()))
    }

    struct Doubler;

    #[async_trait]
    impl NodeHandler for Doubler {
        async fn run(&self, params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
            let v = params["value"].as_i64().unwrap_or(0);
            Ok(json!({"result": v * 2}))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl NodeHandler for Sleeper {
        async fn run(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    struct FailsThenSucceeds {
        failures: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl NodeHandler for FailsThenSucceeds {
        async fn run(&self, _params: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                if self.transient {
                    return Err(NodeError::transient("connection reset"));
                }
                return Err(NodeError::permanent("bad request"));
            }
            Ok(json!({"result": "ok"}))
        }
    }

    #[tokio::test]
    async fn completed_node_writes_store_and_emits_lifecycle() {
        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        let record = execute_node(
            &node("a", "double", json!({"value": 21})),
            &entry(spec("double", false), Arc::new(FnFactory(|| Box::new(Doubler) as Box<dyn NodeHandler>))),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(store.get("a").unwrap()["result"], 42);

        callbacks.complete(&Default::default());
        let events = sub.collect().await;
        let statuses: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::NodeResult)
            .map(|e| e.payload["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["running", "completed"]);
    }

    #[tokio::test]
    async fn resolution_failure_skips_handler_and_running_event() {
        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        let record = execute_node(
            &node("a", "double", json!({"value": "$ghost.out"})),
            &entry(spec("double", false), Arc::new(FnFactory(|| Box::new(Doubler) as Box<dyn NodeHandler>))),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Failed);
        assert!(record.error.as_ref().unwrap().starts_with("resolution:"));
        assert!(store.is_empty());

        callbacks.complete(&Default::default());
        let events = sub.collect().await;
        let node_events: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::NodeResult)
            .map(|e| e.payload["status"].as_str().unwrap())
            .collect();
        assert_eq!(node_events, vec!["failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_node() {
        let (_bus, callbacks, store) = harness();

        let record = execute_node(
            &node("slow", "sleep", json!({"timeout": 2})),
            &entry(spec("sleep", false), Arc::new(FnFactory(|| Box::new(Sleeper) as Box<dyn NodeHandler>))),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("timeout"));
        assert!(record.error.as_ref().unwrap().contains("2s"));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        let factory = Arc::new(FnFactory(|| {
            Box::new(FailsThenSucceeds {
                failures: AtomicU32::new(2),
                transient: true,
            }) as Box<dyn NodeHandler>
        }));

        let record = execute_node(
            &node("f", "flaky", json!({})),
            &entry(spec("flaky", true), factory),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Completed);
        callbacks.complete(&Default::default());

        let events = sub.collect().await;
        let retries: Vec<u64> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolRetry)
            .map(|e| e.payload["attempt"].as_u64().unwrap())
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_surfaces_last_failure() {
        let (_bus, callbacks, store) = harness();

        let factory = Arc::new(FnFactory(|| {
            Box::new(FailsThenSucceeds {
                failures: AtomicU32::new(99),
                transient: true,
            }) as Box<dyn NodeHandler>
        }));

        let record = execute_node(
            &node("f", "flaky", json!({})),
            &entry(spec("flaky", true), factory),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Failed);
        assert!(record.error.as_ref().unwrap().contains("transient_io"));
    }

    #[tokio::test]
    async fn permanent_failures_never_retry() {
        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        let factory = Arc::new(FnFactory(|| {
            Box::new(FailsThenSucceeds {
                failures: AtomicU32::new(1),
                transient: false,
            }) as Box<dyn NodeHandler>
        }));

        let record = execute_node(
            &node("f", "flaky", json!({})),
            &entry(spec("flaky", true), factory),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Failed);
        callbacks.complete(&Default::default());
        let events = sub.collect().await;
        assert!(events.iter().all(|e| e.kind != EventKind::ToolRetry));
    }

    #[tokio::test]
    async fn transient_failure_without_retryable_spec_fails_fast() {
        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        let factory = Arc::new(FnFactory(|| {
            Box::new(FailsThenSucceeds {
                failures: AtomicU32::new(1),
                transient: true,
            }) as Box<dyn NodeHandler>
        }));

        let record = execute_node(
            &node("f", "notretry", json!({})),
            &entry(spec("notretry", false), factory),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Failed);
        callbacks.complete(&Default::default());
        let events = sub.collect().await;
        assert!(events.iter().all(|e| e.kind != EventKind::ToolRetry));
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled_record() {
        let (_bus, callbacks, store) = harness();
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let record = execute_node(
            &node("slow", "sleep", json!({})),
            &entry(spec("sleep", false), Arc::new(FnFactory(|| Box::new(Sleeper) as Box<dyn NodeHandler>))),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            token,
            None,
        )
        .await;

        assert_eq!(record.status, NodeStatus::Cancelled);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn progress_updates_republished_as_tool_progress() {
        struct Progressive;

        #[async_trait]
        impl NodeHandler for Progressive {
            async fn run(&self, _params: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
                ctx.progress(json!({"pct": 50}));
                Ok(json!({"result": 1}))
            }
        }

        let (bus, callbacks, store) = harness();
        let sub = bus.subscribe("s").unwrap();

        execute_node(
            &node("p", "prog", json!({})),
            &entry(spec("prog", false), Arc::new(FnFactory(|| Box::new(Progressive) as Box<dyn NodeHandler>))),
            &store,
            &callbacks,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            CancellationToken::new(),
            None,
        )
        .await;

        callbacks.complete(&Default::default());
        let events = sub.collect().await;
        let progress: Vec<&Event> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolProgress)
            .collect();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].payload["node_id"], "p");
        assert_eq!(progress[0].payload["data"]["pct"], 50);
    }
}

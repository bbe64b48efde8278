//! Loop sub-scheduler: expands a nested workflow once per element of an
//! input sequence, exposing per-iteration context under the reserved
//! `loop` id.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::scheduler::Scheduler;
use super::store::OutputStore;
use crate::callback::RunCallbacks;
use crate::catalog::{NodeError, NodeErrorKind};
use crate::event::NodeRecord;
use crate::reference::resolve_value;
use crate::workflow::{validate_in_loop_scope, WorkflowDocument, WorkflowNode, LOOP_CONTEXT_ID};

/// Run one loop node to a terminal record.
///
/// Each iteration validates and runs the nested workflow over a fresh
/// store seeded with the loop context; iterations are sequential and
/// fail-fast unless `continue_on_error` is set. The terminal output is
/// `{results, total, success}` where each result is the output of the
/// final node (by topological rank) of that iteration.
pub(crate) async fn run_loop(
    scheduler: &Scheduler,
    node: &WorkflowNode,
    store: &Arc<OutputStore>,
    callbacks: &Arc<RunCallbacks>,
    cancel: CancellationToken,
    iteration: Option<usize>,
) -> NodeRecord {
    let started_at = chrono::Utc::now();

    let fail = |error: NodeError| {
        let mut record = NodeRecord::failed(&node.id, error.to_string(), iteration);
        record.started_at = started_at;
        callbacks.node_result(&record);
        record
    };

    // Resolve the loop's own params against the parent store.
    let params = match resolve_value(&Value::Object(node.params.clone()), store) {
        Ok(params) => params,
        Err(e) => return fail(NodeError::new(NodeErrorKind::Resolution, e.to_string())),
    };

    let Some(items) = params.get("array").and_then(Value::as_array).cloned() else {
        return fail(NodeError::validation(
            "param 'array' did not resolve to a sequence",
        ));
    };
    let continue_on_error = params
        .get("continue_on_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    // The nested document may arrive as a mapping or a JSON string.
    let raw_doc = match params.get("workflow_json") {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => parsed,
            Err(e) => {
                return fail(NodeError::validation(format!(
                    "param 'workflow_json' is not valid JSON: {e}"
                )))
            }
        },
        Some(other) => other.clone(),
        None => return fail(NodeError::validation("missing param 'workflow_json'")),
    };
    let doc: WorkflowDocument = match serde_json::from_value(raw_doc) {
        Ok(doc) => doc,
        Err(e) => {
            return fail(NodeError::validation(format!(
                "param 'workflow_json' is not a workflow document: {e}"
            )))
        }
    };
    let child = match validate_in_loop_scope(scheduler.registry(), &doc) {
        Ok(child) => child,
        Err(e) => {
            return fail(NodeError::validation(format!(
                "nested workflow invalid: {e}"
            )))
        }
    };

    let mut running = NodeRecord::running(&node.id, iteration);
    running.started_at = started_at;
    callbacks.node_result(&running);

    let total = items.len();
    let final_node = child
        .topo_order()
        .last()
        .map(|id| id.to_string())
        .expect("validated workflow is non-empty");

    let mut results = Vec::with_capacity(total);
    let mut success = true;

    for (index, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            let mut record = NodeRecord::cancelled(&node.id, iteration);
            record.started_at = started_at;
            callbacks.node_result(&record);
            return record;
        }

        debug!(node_id = %node.id, index, total, "loop iteration");

        let child_store = Arc::new(OutputStore::new());
        child_store
            .insert(
                LOOP_CONTEXT_ID,
                json!({
                    "index": index,
                    "item": item,
                    "length": total,
                    "first": index == 0,
                    "last": index + 1 == total,
                }),
            )
            .expect("fresh store has no loop entry");

        let outcome = scheduler
            .run_with_store(
                &child,
                child_store,
                Arc::clone(callbacks),
                cancel.child_token(),
                Some(index),
                false,
            )
            .await;

        if outcome.summary.is_success() {
            let data = outcome
                .records
                .get(&final_node)
                .and_then(|r| r.data.clone())
                .unwrap_or(Value::Null);
            results.push(data);
            continue;
        }

        if cancel.is_cancelled() {
            let mut record = NodeRecord::cancelled(&node.id, iteration);
            record.started_at = started_at;
            callbacks.node_result(&record);
            return record;
        }

        if continue_on_error {
            results.push(Value::Null);
            success = false;
        } else {
            let detail = outcome
                .records
                .values()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "node failure".to_string());
            return fail(NodeError::permanent(format!(
                "iteration {index} failed: {detail}"
            )));
        }
    }

    let output = json!({
        "results": results,
        "total": total,
        "success": success,
    });

    if let Err(e) = store.insert(&node.id, output.clone()) {
        return fail(NodeError::executor_bug(e.to_string()));
    }

    let mut record = NodeRecord::completed(&node.id, output, iteration);
    record.started_at = started_at;
    callbacks.node_result(&record);
    record
}

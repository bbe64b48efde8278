//! Callback facade: the narrow event surface the executor, scheduler,
//! looper, and agent publish through, without knowing about the bus.
//!
//! Guarantees: at most one terminal event per run, and per-session
//! timestamps that never decrease.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::event::{Event, EventKind, NodeRecord, RunSummary};
use crate::session::SessionBus;

pub struct RunCallbacks {
    bus: Arc<SessionBus>,
    session_id: String,
    run_id: Uuid,
    terminal_sent: AtomicBool,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl RunCallbacks {
    pub fn new(bus: Arc<SessionBus>, session_id: &str) -> Self {
        Self {
            bus,
            session_id: session_id.to_string(),
            run_id: Uuid::new_v4(),
            terminal_sent: AtomicBool::new(false),
            last_timestamp: Mutex::new(Utc::now()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::SeqCst)
    }

    /// Stamp and publish under one lock so parallel workers cannot
    /// interleave timestamps out of stream order.
    fn emit(&self, kind: EventKind, payload: Value) {
        let mut last = self.last_timestamp.lock().expect("timestamp lock poisoned");
        let mut now = Utc::now();
        if now < *last {
            now = *last;
        }
        *last = now;

        let event = Event {
            kind,
            payload,
            timestamp: now,
            session_id: self.session_id.clone(),
        };
        if let Err(e) = self.bus.publish(event) {
            warn!(kind = kind.as_str(), error = %e, "dropping event for dead session");
        }
    }

    fn payload_of(record: &NodeRecord) -> Value {
        serde_json::to_value(record).unwrap_or_else(|e| {
            warn!(node_id = %record.node_id, error = %e, "node record not serializable");
            Value::Null
        })
    }

    // -- run lifecycle -----------------------------------------------------

    pub fn status(&self, message: &str, detail: Value) {
        self.emit(EventKind::Status, json!({ "message": message, "detail": detail }));
    }

    pub fn workflow(&self, document: Value) {
        self.emit(EventKind::Workflow, document);
    }

    /// Terminal success event with the aggregate summary.
    pub fn complete(&self, summary: &RunSummary) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "terminal event already sent, ignoring complete");
            return;
        }
        let payload = serde_json::to_value(summary).unwrap_or(Value::Null);
        self.emit(EventKind::Complete, payload);
    }

    /// Terminal fatal error event.
    pub fn error(&self, message: &str) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "terminal event already sent, ignoring error");
            return;
        }
        self.emit(EventKind::Error, json!({ "message": message }));
    }

    // -- node lifecycle ----------------------------------------------------

    pub fn node_result(&self, record: &NodeRecord) {
        self.emit(EventKind::NodeResult, Self::payload_of(record));
    }

    pub fn tool_progress(&self, node_id: &str, data: Value) {
        self.emit(
            EventKind::ToolProgress,
            json!({ "node_id": node_id, "data": data }),
        );
    }

    pub fn tool_retry(&self, node_id: &str, attempt: u32, max_retries: u32, error: &str) {
        self.emit(
            EventKind::ToolRetry,
            json!({
                "node_id": node_id,
                "attempt": attempt,
                "max_retries": max_retries,
                "error": error,
            }),
        );
    }

    // -- agent lifecycle ---------------------------------------------------

    pub fn explanation(&self, text: &str) {
        self.emit(EventKind::Explanation, json!({ "text": text }));
    }

    pub fn answer(&self, text: &str) {
        self.emit(EventKind::Answer, json!({ "text": text }));
    }

    pub fn agent_start(&self, query: &str, max_iterations: u32) {
        self.emit(
            EventKind::AgentStart,
            json!({ "query": query, "max_iterations": max_iterations }),
        );
    }

    pub fn agent_thinking(&self, thought: &str) {
        self.emit(EventKind::AgentThinking, json!({ "thought": thought }));
    }

    pub fn agent_error(&self, message: &str) {
        self.emit(EventKind::AgentError, json!({ "error": message }));
    }

    pub fn agent_complete(&self, iterations: u32, answer: Option<&str>) {
        self.emit(
            EventKind::AgentComplete,
            json!({ "iterations": iterations, "answer": answer }),
        );
    }

    pub fn action_start(&self, action: &str, input: &Value, action_id: Uuid) {
        self.emit(
            EventKind::ActionStart,
            json!({ "action": action, "input": input, "action_id": action_id }),
        );
    }

    pub fn action_complete(&self, action_id: Uuid, result: &NodeRecord) {
        self.emit(
            EventKind::ActionComplete,
            json!({ "action_id": action_id, "result": Self::payload_of(result) }),
        );
    }
}

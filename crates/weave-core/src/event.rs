//! Event model: the typed stream a run publishes to its session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized event kinds multiplexed onto a session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Workflow,
    NodeResult,
    Explanation,
    Answer,
    ToolProgress,
    ToolRetry,
    ActionStart,
    ActionComplete,
    AgentStart,
    AgentThinking,
    AgentError,
    AgentComplete,
    Complete,
    Error,
}

impl EventKind {
    /// Terminal kinds close the session stream once observed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Complete | EventKind::Error)
    }

    /// Wire name, identical to the serde snake_case rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Workflow => "workflow",
            EventKind::NodeResult => "node_result",
            EventKind::Explanation => "explanation",
            EventKind::Answer => "answer",
            EventKind::ToolProgress => "tool_progress",
            EventKind::ToolRetry => "tool_retry",
            EventKind::ActionStart => "action_start",
            EventKind::ActionComplete => "action_complete",
            EventKind::AgentStart => "agent_start",
            EventKind::AgentThinking => "agent_thinking",
            EventKind::AgentError => "agent_error",
            EventKind::AgentComplete => "agent_complete",
            EventKind::Complete => "complete",
            EventKind::Error => "error",
        }
    }
}

/// A single event on a session stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

impl Event {
    pub fn new(kind: EventKind, session_id: &str, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node lifecycle records (payload of `node_result` events)
// ---------------------------------------------------------------------------

/// Status of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

/// Result of one node state transition, published as a `node_result` event.
///
/// `data` is present iff `status == Completed`; `error` iff the node failed
/// or was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
}

impl NodeRecord {
    /// A `running` transition for the given node.
    pub fn running(node_id: &str, iteration: Option<usize>) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Running,
            data: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
            iteration,
        }
    }

    /// Terminal `completed` record carrying the node's output.
    pub fn completed(node_id: &str, data: Value, iteration: Option<usize>) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Completed,
            data: Some(data),
            error: None,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            iteration,
        }
    }

    /// Terminal `failed` record carrying the error message.
    pub fn failed(node_id: &str, error: impl Into<String>, iteration: Option<usize>) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Failed,
            data: None,
            error: Some(error.into()),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            iteration,
        }
    }

    /// Terminal `cancelled` record.
    pub fn cancelled(node_id: &str, iteration: Option<usize>) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Cancelled,
            data: None,
            error: Some("cancelled".to_string()),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            iteration,
        }
    }
}

// ---------------------------------------------------------------------------
// Run summary (payload of the terminal `complete` event)
// ---------------------------------------------------------------------------

/// Aggregate counts published with the terminal `complete` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunSummary {
    /// A run succeeded iff every node completed.
    pub fn is_success(&self) -> bool {
        self.completed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::NodeResult).unwrap(),
            "\"node_result\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::AgentThinking).unwrap(),
            "\"agent_thinking\""
        );
        let back: EventKind = serde_json::from_str("\"tool_retry\"").unwrap();
        assert_eq!(back, EventKind::ToolRetry);
    }

    #[test]
    fn wire_name_matches_serde_rendering() {
        for kind in [
            EventKind::Status,
            EventKind::Workflow,
            EventKind::NodeResult,
            EventKind::Explanation,
            EventKind::Answer,
            EventKind::ToolProgress,
            EventKind::ToolRetry,
            EventKind::ActionStart,
            EventKind::ActionComplete,
            EventKind::AgentStart,
            EventKind::AgentThinking,
            EventKind::AgentError,
            EventKind::AgentComplete,
            EventKind::Complete,
            EventKind::Error,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn only_complete_and_error_are_terminal() {
        assert!(EventKind::Complete.is_terminal());
        assert!(EventKind::Error.is_terminal());
        assert!(!EventKind::NodeResult.is_terminal());
        assert!(!EventKind::AgentComplete.is_terminal());
    }

    #[test]
    fn completed_record_carries_data_not_error() {
        let rec = NodeRecord::completed("a", serde_json::json!({"result": 30}), None);
        assert_eq!(rec.status, NodeStatus::Completed);
        assert!(rec.data.is_some());
        assert!(rec.error.is_none());
        assert!(rec.ended_at.is_some());
    }

    #[test]
    fn failed_record_omits_data_in_json() {
        let rec = NodeRecord::failed("b", "boom", Some(2));
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("data").is_none());
        assert_eq!(json["error"], "boom");
        assert_eq!(json["iteration"], 2);
    }

    #[test]
    fn summary_success_requires_all_completed() {
        let ok = RunSummary {
            total: 2,
            completed: 2,
            ..Default::default()
        };
        assert!(ok.is_success());

        let partial = RunSummary {
            total: 3,
            completed: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(!partial.is_success());
    }
}

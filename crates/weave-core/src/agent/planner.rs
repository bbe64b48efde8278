//! Planner contract for agent mode.
//!
//! The planner is the seam to the LLM: given the query and the trace of
//! `(action, input, observation)` steps so far, it either picks the next
//! tool or produces the final answer. The LLM-backed implementation lives
//! outside the core; [`ScriptedPlanner`] serves tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::AgentError;

/// One completed reason-act step.
#[derive(Debug, Clone)]
pub struct AgentStep {
    pub action: String,
    pub input: Value,
    pub observation: Value,
}

/// What the planner decided for the current iteration.
#[derive(Debug, Clone)]
pub enum PlannerDecision {
    /// Invoke a tool with the given input.
    Action {
        thought: String,
        action: String,
        input: Value,
    },
    /// Stop and answer.
    Final { thought: String, answer: String },
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, query: &str, trace: &[AgentStep]) -> Result<PlannerDecision, AgentError>;
}

/// Replays a fixed decision sequence.
pub struct ScriptedPlanner {
    decisions: Mutex<VecDeque<PlannerDecision>>,
}

impl ScriptedPlanner {
    pub fn new(decisions: Vec<PlannerDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _query: &str, _trace: &[AgentStep]) -> Result<PlannerDecision, AgentError> {
        self.decisions
            .lock()
            .expect("planner script lock poisoned")
            .pop_front()
            .ok_or_else(|| AgentError::Planner("scripted planner exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_planner_replays_in_order() {
        let planner = ScriptedPlanner::new(vec![
            PlannerDecision::Action {
                thought: "add first".into(),
                action: "add".into(),
                input: json!({"num1": 1, "num2": 2}),
            },
            PlannerDecision::Final {
                thought: "done".into(),
                answer: "3".into(),
            },
        ]);

        let first = planner.plan("q", &[]).await.unwrap();
        assert!(matches!(first, PlannerDecision::Action { ref action, .. } if action == "add"));

        let second = planner.plan("q", &[]).await.unwrap();
        assert!(matches!(second, PlannerDecision::Final { ref answer, .. } if answer == "3"));

        let err = planner.plan("q", &[]).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }
}

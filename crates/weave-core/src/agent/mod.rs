//! Agent mode: a bounded reason-act loop over the node catalog.
//!
//! Each iteration the planner either picks one tool (a node type) or
//! finishes with an answer. Tool invocations run through the same node
//! executor as workflow runs, against a private output store, and their
//! results feed the next planner call as observations.

pub mod planner;

pub use planner::{AgentStep, Planner, PlannerDecision, ScriptedPlanner};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::callback::RunCallbacks;
use crate::catalog::NodeRegistry;
use crate::config::WeaveConfig;
use crate::event::{NodeStatus, RunSummary};
use crate::runtime::{execute_node, OutputStore, RetryPolicy};
use crate::workflow::WorkflowNode;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("planner error: {0}")]
    Planner(String),
}

/// Result of one agent run.
#[derive(Debug)]
pub struct AgentOutcome {
    pub answer: Option<String>,
    pub iterations: u32,
    pub steps: Vec<AgentStep>,
}

/// Bounded reason-act cycle over the node catalog.
pub struct AgentLoop {
    registry: Arc<NodeRegistry>,
    config: Arc<WeaveConfig>,
    planner: Arc<dyn Planner>,
}

impl AgentLoop {
    pub fn new(
        registry: Arc<NodeRegistry>,
        config: Arc<WeaveConfig>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            registry,
            config,
            planner,
        }
    }

    /// Run the loop to completion. Publishes `agent_*` events along the
    /// way and always ends the session with a terminal event.
    pub async fn run(
        &self,
        query: &str,
        callbacks: Arc<RunCallbacks>,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        let max_iterations = self.config.agent.max_iterations;
        callbacks.agent_start(query, max_iterations);
        info!(run_id = %callbacks.run_id(), max_iterations, "starting agent run");

        let store = Arc::new(OutputStore::new());
        let retry = RetryPolicy::from_config(&self.config.general);
        let fallback_timeout = Duration::from_secs(self.config.general.default_timeout_seconds);

        let mut steps: Vec<AgentStep> = Vec::new();
        let mut summary = RunSummary::default();
        let mut iterations = 0u32;

        while iterations < max_iterations {
            if cancel.is_cancelled() {
                callbacks.agent_error("cancelled");
                callbacks.complete(&summary);
                return AgentOutcome {
                    answer: None,
                    iterations,
                    steps,
                };
            }

            iterations += 1;
            let decision = match self.planner.plan(query, &steps).await {
                Ok(decision) => decision,
                Err(e) => {
                    callbacks.agent_error(&e.to_string());
                    callbacks.error(&format!("agent aborted: {e}"));
                    return AgentOutcome {
                        answer: None,
                        iterations,
                        steps,
                    };
                }
            };

            match decision {
                PlannerDecision::Final { thought, answer } => {
                    callbacks.agent_thinking(&thought);
                    callbacks.answer(&answer);
                    callbacks.agent_complete(iterations, Some(&answer));
                    callbacks.complete(&summary);
                    info!(run_id = %callbacks.run_id(), iterations, "agent finished");
                    return AgentOutcome {
                        answer: Some(answer),
                        iterations,
                        steps,
                    };
                }
                PlannerDecision::Action {
                    thought,
                    action,
                    input,
                } => {
                    callbacks.agent_thinking(&thought);

                    let entry = match self.registry.lookup(&action) {
                        Ok(entry) => entry.clone(),
                        Err(e) => {
                            // Let the planner observe the mistake and recover.
                            debug!(action = %action, "planner chose unknown tool");
                            callbacks.agent_error(&e.to_string());
                            steps.push(AgentStep {
                                action,
                                input,
                                observation: json!({ "error": e.to_string() }),
                            });
                            continue;
                        }
                    };

                    let action_id = Uuid::new_v4();
                    callbacks.action_start(&action, &input, action_id);

                    let node = WorkflowNode {
                        id: format!("{action}_{iterations}"),
                        node_type: action.clone(),
                        params: action_params(&input, &entry.spec),
                    };

                    summary.total += 1;
                    let record = execute_node(
                        &node,
                        &entry,
                        &store,
                        &callbacks,
                        &retry,
                        fallback_timeout,
                        cancel.child_token(),
                        None,
                    )
                    .await;

                    callbacks.action_complete(action_id, &record);

                    match record.status {
                        NodeStatus::Completed => summary.completed += 1,
                        NodeStatus::Cancelled => summary.cancelled += 1,
                        _ => summary.failed += 1,
                    }

                    let observation = match (&record.data, &record.error) {
                        (Some(data), _) => data.clone(),
                        (None, Some(error)) => json!({ "error": error }),
                        (None, None) => Value::Null,
                    };
                    steps.push(AgentStep {
                        action,
                        input,
                        observation,
                    });
                }
            }
        }

        // Budget exhausted: surface the best-effort partial answer.
        callbacks.agent_error("iteration budget exhausted");
        let partial = steps
            .last()
            .map(|step| step.observation.to_string());
        if let Some(text) = &partial {
            callbacks.answer(text);
        }
        callbacks.agent_complete(iterations, partial.as_deref());
        callbacks.complete(&summary);
        AgentOutcome {
            answer: partial,
            iterations,
            steps,
        }
    }
}

/// Shape the planner's tool input into a parameter map, materializing
/// declared defaults.
fn action_params(input: &Value, spec: &crate::catalog::NodeSpec) -> Map<String, Value> {
    let mut params = match input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    for param in &spec.params {
        if !params.contains_key(&param.name) {
            if let Some(default) = &param.default {
                params.insert(param.name.clone(), default.clone());
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::event::EventKind;
    use crate::session::SessionBus;

    #[tokio::test]
    async fn reason_act_then_final_answer() {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("agent").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "agent"));
        let sub = bus.subscribe("agent").unwrap();

        let planner = Arc::new(ScriptedPlanner::new(vec![
            PlannerDecision::Action {
                thought: "compute the sum first".into(),
                action: "add".into(),
                input: json!({"num1": 10, "num2": 20}),
            },
            PlannerDecision::Final {
                thought: "the sum is known".into(),
                answer: "the sum is 30".into(),
            },
        ]));
        let agent = AgentLoop::new(
            Arc::new(catalog::builtin::registry().unwrap()),
            Arc::new(WeaveConfig::default()),
            planner,
        );

        let outcome = agent
            .run("what is 10 + 20?", callbacks, CancellationToken::new())
            .await;

        assert_eq!(outcome.answer.as_deref(), Some("the sum is 30"));
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].observation["result"], 30);

        let events = sub.collect().await;
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], EventKind::AgentStart);
        assert!(kinds.contains(&EventKind::AgentThinking));
        assert!(kinds.contains(&EventKind::ActionStart));
        assert!(kinds.contains(&EventKind::ActionComplete));
        assert!(kinds.contains(&EventKind::Answer));
        assert!(kinds.contains(&EventKind::AgentComplete));
        assert_eq!(*kinds.last().unwrap(), EventKind::Complete);

        // action_start precedes action_complete.
        let start_idx = kinds.iter().position(|k| *k == EventKind::ActionStart).unwrap();
        let done_idx = kinds.iter().position(|k| *k == EventKind::ActionComplete).unwrap();
        assert!(start_idx < done_idx);
    }

    #[tokio::test]
    async fn budget_exhaustion_emits_agent_error_and_partial() {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("agent").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "agent"));
        let sub = bus.subscribe("agent").unwrap();

        let planner = Arc::new(ScriptedPlanner::new(vec![
            PlannerDecision::Action {
                thought: "step one".into(),
                action: "add".into(),
                input: json!({"num1": 1, "num2": 1}),
            },
            PlannerDecision::Action {
                thought: "step two".into(),
                action: "add".into(),
                input: json!({"num1": 2, "num2": 2}),
            },
        ]));
        let mut config = WeaveConfig::default();
        config.agent.max_iterations = 2;
        let agent = AgentLoop::new(
            Arc::new(catalog::builtin::registry().unwrap()),
            Arc::new(config),
            planner,
        );

        let outcome = agent.run("loop forever", callbacks, CancellationToken::new()).await;

        assert_eq!(outcome.iterations, 2);
        // Best-effort partial answer from the last observation.
        assert!(outcome.answer.unwrap().contains("4"));

        let events = sub.collect().await;
        let agent_errors: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::AgentError)
            .map(|e| e.payload["error"].as_str().unwrap())
            .collect();
        assert_eq!(agent_errors, vec!["iteration budget exhausted"]);
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_observation_and_agent_recovers() {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("agent").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "agent"));

        let planner = Arc::new(ScriptedPlanner::new(vec![
            PlannerDecision::Action {
                thought: "try a tool that does not exist".into(),
                action: "teleport".into(),
                input: json!({}),
            },
            PlannerDecision::Final {
                thought: "recovered".into(),
                answer: "done without teleport".into(),
            },
        ]));
        let agent = AgentLoop::new(
            Arc::new(catalog::builtin::registry().unwrap()),
            Arc::new(WeaveConfig::default()),
            planner,
        );

        let outcome = agent.run("q", callbacks, CancellationToken::new()).await;

        assert_eq!(outcome.answer.as_deref(), Some("done without teleport"));
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].observation["error"]
            .as_str()
            .unwrap()
            .contains("teleport"));
    }

    #[tokio::test]
    async fn tool_failure_is_observed_not_fatal() {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("agent").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "agent"));

        let planner = Arc::new(ScriptedPlanner::new(vec![
            PlannerDecision::Action {
                thought: "call the failing tool".into(),
                action: "flaky".into(),
                input: json!({"fail_times": 99, "transient": false}),
            },
            PlannerDecision::Final {
                thought: "observed the failure".into(),
                answer: "tool failed".into(),
            },
        ]));
        let agent = AgentLoop::new(
            Arc::new(catalog::builtin::registry().unwrap()),
            Arc::new(WeaveConfig::default()),
            planner,
        );

        let outcome = agent.run("q", callbacks, CancellationToken::new()).await;

        assert_eq!(outcome.answer.as_deref(), Some("tool failed"));
        assert!(outcome.steps[0].observation["error"]
            .as_str()
            .unwrap()
            .contains("injected failure"));
    }

    #[tokio::test]
    async fn planner_failure_ends_with_error_event() {
        let bus = Arc::new(SessionBus::default());
        bus.create_session("agent").unwrap();
        let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), "agent"));
        let sub = bus.subscribe("agent").unwrap();

        // Empty script: the first plan() call fails.
        let planner = Arc::new(ScriptedPlanner::new(vec![]));
        let agent = AgentLoop::new(
            Arc::new(catalog::builtin::registry().unwrap()),
            Arc::new(WeaveConfig::default()),
            planner,
        );

        let outcome = agent.run("q", callbacks, CancellationToken::new()).await;
        assert!(outcome.answer.is_none());

        let events = sub.collect().await;
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
    }
}

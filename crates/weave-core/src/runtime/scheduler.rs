//! DAG scheduler: fans out ready nodes onto a bounded worker pool,
//! propagates failure along forward-reachable dependents, and emits the
//! aggregate terminal event.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{execute_node, RetryPolicy};
use super::looper::run_loop;
use super::store::OutputStore;
use crate::callback::RunCallbacks;
use crate::catalog::NodeRegistry;
use crate::config::WeaveConfig;
use crate::event::{NodeRecord, NodeStatus, RunSummary};
use crate::workflow::{Workflow, LOOP_NODE_TYPE};

/// Per-node scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedState {
    Pending,
    Ready,
    Running,
    Done,
}

/// Result of a whole workflow run.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub records: HashMap<String, NodeRecord>,
    pub store: Arc<OutputStore>,
}

/// Drives validated workflows to completion. Cheap to clone; loop nodes
/// clone it to run their subgraphs.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    config: Arc<WeaveConfig>,
}

impl Scheduler {
    pub fn new(registry: Arc<NodeRegistry>, config: Arc<WeaveConfig>) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<WeaveConfig> {
        &self.config
    }

    /// Run a workflow against a fresh output store and emit the terminal
    /// `complete` event when every node reaches a terminal state.
    pub async fn run(
        &self,
        workflow: &Workflow,
        callbacks: Arc<RunCallbacks>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let store = Arc::new(OutputStore::new());
        self.run_with_store(workflow, store, callbacks, cancel, None, true)
            .await
    }

    /// Inner entry point shared with the loop sub-scheduler: loop subgraphs
    /// run against a seeded store, tag records with their iteration, and
    /// leave the terminal event to the outermost run.
    ///
    /// Returns a boxed future (rather than being an `async fn`) because
    /// `run_loop` calls back into this function, and the compiler cannot
    /// otherwise prove the resulting directly-recursive opaque future type
    /// is `Send`.
    pub(crate) fn run_with_store<'a>(
        &'a self,
        workflow: &'a Workflow,
        store: Arc<OutputStore>,
        callbacks: Arc<RunCallbacks>,
        cancel: CancellationToken,
        iteration: Option<usize>,
        emit_terminal: bool,
    ) -> Pin<Box<dyn Future<Output = RunOutcome> + Send + 'a>> {
        Box::pin(self.run_with_store_inner(
            workflow,
            store,
            callbacks,
            cancel,
            iteration,
            emit_terminal,
        ))
    }

    async fn run_with_store_inner(
        &self,
        workflow: &Workflow,
        store: Arc<OutputStore>,
        callbacks: Arc<RunCallbacks>,
        cancel: CancellationToken,
        iteration: Option<usize>,
        emit_terminal: bool,
    ) -> RunOutcome {
        let total = workflow.nodes.len();
        if emit_terminal {
            callbacks.status("workflow started", json!({ "total": total }));
            info!(run_id = %callbacks.run_id(), total, "starting workflow run");
        }

        let retry = RetryPolicy::from_config(&self.config.general);
        let fallback_timeout = Duration::from_secs(self.config.general.default_timeout_seconds);
        let max_workers = self.config.general.max_workers.max(1);

        // Dependency bookkeeping.
        let mut states: HashMap<String, SchedState> = HashMap::with_capacity(total);
        let mut in_degree: HashMap<String, usize> = HashMap::with_capacity(total);
        let mut successors: HashMap<String, Vec<String>> = HashMap::with_capacity(total);
        for node in &workflow.nodes {
            states.insert(node.id.clone(), SchedState::Pending);
            in_degree.insert(node.id.clone(), 0);
            successors.insert(node.id.clone(), Vec::new());
        }
        for edge in &workflow.edges {
            *in_degree.get_mut(&edge.to).expect("validated edge") += 1;
            successors
                .get_mut(&edge.from)
                .expect("validated edge")
                .push(edge.to.clone());
        }

        // Ready queue ordered by topological rank.
        let mut ready: BinaryHeap<Reverse<(usize, String)>> = BinaryHeap::new();
        for (id, &deg) in &in_degree {
            if deg == 0 {
                states.insert(id.clone(), SchedState::Ready);
                ready.push(Reverse((workflow.rank(id), id.clone())));
            }
        }

        let mut records: HashMap<String, NodeRecord> = HashMap::with_capacity(total);
        let mut tasks: JoinSet<(String, NodeRecord)> = JoinSet::new();
        let mut running_tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut active = 0usize;
        let mut cancel_seen = false;

        loop {
            // Fill free workers from the ready queue, lowest rank first.
            while active < max_workers && !cancel_seen {
                let Some(Reverse((_, id))) = ready.pop() else {
                    break;
                };
                if states.get(&id) != Some(&SchedState::Ready) {
                    continue;
                }
                states.insert(id.clone(), SchedState::Running);
                active += 1;

                let node = workflow
                    .node(&id)
                    .expect("ready node exists in workflow")
                    .clone();
                let token = cancel.child_token();
                running_tokens.insert(id.clone(), token.clone());

                let scheduler = self.clone();
                let store = Arc::clone(&store);
                let callbacks = Arc::clone(&callbacks);
                let retry = retry.clone();
                debug!(node_id = %id, "launching node");
                tasks.spawn(async move {
                    let record = if node.node_type == LOOP_NODE_TYPE {
                        run_loop(&scheduler, &node, &store, &callbacks, token, iteration).await
                    } else {
                        match scheduler.registry.lookup(&node.node_type) {
                            Ok(entry) => {
                                execute_node(
                                    &node,
                                    entry,
                                    &store,
                                    &callbacks,
                                    &retry,
                                    fallback_timeout,
                                    token,
                                    iteration,
                                )
                                .await
                            }
                            Err(e) => {
                                // Unreachable for validated workflows.
                                let record =
                                    NodeRecord::failed(&node.id, e.to_string(), iteration);
                                callbacks.node_result(&record);
                                record
                            }
                        }
                    };
                    (node.id, record)
                });
            }

            if active == 0 {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    debug!("run cancelled; draining workers");
                    // Nodes not yet launched terminate as cancelled; running
                    // nodes observe their child tokens and finish on their own.
                    for node in &workflow.nodes {
                        let state = states.get(&node.id).copied();
                        if matches!(state, Some(SchedState::Pending | SchedState::Ready)) {
                            states.insert(node.id.clone(), SchedState::Done);
                            let record = NodeRecord::cancelled(&node.id, iteration);
                            callbacks.node_result(&record);
                            records.insert(node.id.clone(), record);
                        }
                    }
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok((id, record))) => {
                            active -= 1;
                            running_tokens.remove(&id);
                            self.settle(
                                &id,
                                record,
                                workflow,
                                &mut states,
                                &mut in_degree,
                                &successors,
                                &mut ready,
                                &mut records,
                                &running_tokens,
                                &callbacks,
                                iteration,
                            );
                        }
                        Some(Err(e)) => {
                            active -= 1;
                            warn!(error = %e, "node task aborted");
                        }
                        None => break,
                    }
                }
            }
        }

        // A panicked task leaves its node without a record.
        for node in &workflow.nodes {
            if !records.contains_key(&node.id) {
                let record =
                    NodeRecord::failed(&node.id, "executor_bug: node task aborted", iteration);
                callbacks.node_result(&record);
                records.insert(node.id.clone(), record);
            }
        }

        let summary = summarize(&records, total);
        if emit_terminal {
            info!(
                run_id = %callbacks.run_id(),
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                "workflow run finished"
            );
            callbacks.complete(&summary);
        }

        RunOutcome {
            summary,
            records,
            store,
        }
    }

    /// Record one node's terminal state and update the frontier: successors
    /// of a completed node may become ready; the forward-reachable set of a
    /// failed node fails with it.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        id: &str,
        record: NodeRecord,
        workflow: &Workflow,
        states: &mut HashMap<String, SchedState>,
        in_degree: &mut HashMap<String, usize>,
        successors: &HashMap<String, Vec<String>>,
        ready: &mut BinaryHeap<Reverse<(usize, String)>>,
        records: &mut HashMap<String, NodeRecord>,
        running_tokens: &HashMap<String, CancellationToken>,
        callbacks: &Arc<RunCallbacks>,
        iteration: Option<usize>,
    ) {
        let status = record.status;
        states.insert(id.to_string(), SchedState::Done);
        records.insert(id.to_string(), record);

        match status {
            NodeStatus::Completed => {
                for succ in &successors[id] {
                    if states.get(succ) != Some(&SchedState::Pending) {
                        continue;
                    }
                    let deg = in_degree.get_mut(succ).expect("validated node");
                    *deg -= 1;
                    if *deg == 0 {
                        states.insert(succ.clone(), SchedState::Ready);
                        ready.push(Reverse((workflow.rank(succ), succ.clone())));
                    }
                }
            }
            NodeStatus::Failed | NodeStatus::Cancelled | NodeStatus::Skipped => {
                // Fail-fast: everything downstream fails without running.
                let mut frontier = vec![id.to_string()];
                while let Some(current) = frontier.pop() {
                    for succ in &successors[current.as_str()] {
                        let state = states.get(succ).copied();
                        if !matches!(state, Some(SchedState::Pending | SchedState::Ready)) {
                            continue;
                        }
                        states.insert(succ.clone(), SchedState::Done);
                        let dep_record = NodeRecord::failed(
                            succ,
                            format!("dependency failed: {id}"),
                            iteration,
                        );
                        callbacks.node_result(&dep_record);
                        records.insert(succ.clone(), dep_record);
                        frontier.push(succ.clone());
                    }
                }

                if status == NodeStatus::Failed && !self.config.general.let_running_finish {
                    for (running_id, token) in running_tokens {
                        debug!(node_id = %running_id, "cancelling sibling after failure");
                        token.cancel();
                    }
                }
            }
            NodeStatus::Pending | NodeStatus::Running => {
                // Executor contract: settled records are terminal.
                warn!(node_id = id, ?status, "non-terminal record at settle");
            }
        }
    }
}

fn summarize(records: &HashMap<String, NodeRecord>, total: usize) -> RunSummary {
    let mut summary = RunSummary {
        total,
        ..Default::default()
    };
    for record in records.values() {
        match record.status {
            NodeStatus::Completed => summary.completed += 1,
            NodeStatus::Failed => summary.failed += 1,
            NodeStatus::Cancelled => summary.cancelled += 1,
            NodeStatus::Skipped => summary.skipped += 1,
            NodeStatus::Pending | NodeStatus::Running => {}
        }
    }
    summary
}

//! Run state: everything one run has accumulated so far.
//!
//! [`RunState`] is owned and mutated by the walker alone. Nodes and the
//! expression resolver only ever see an [`RunSnapshot`], which shares the
//! recorded outputs through `Arc`s and never changes once taken.

use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, NodeExecutionError, Result};
use crate::nodes::{DataItem, ItemList, StateChange};
use crate::workflow::Workflow;

/// Why a run was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Manual,
    Trigger,
    Retry,
    ErrorHandler,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Manual => "manual",
            RunMode::Trigger => "trigger",
            RunMode::Retry => "retry",
            RunMode::ErrorHandler => "error_handler",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Waiting,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Waiting => "waiting",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Error | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "waiting" => Ok(RunStatus::Waiting),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(Error::Parse(format!("Unknown run status: {}", s))),
        }
    }
}

/// Outcome of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
    Skipped,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
            ResultStatus::Skipped => "skipped",
        }
    }
}

/// A single item that failed (or failed to resolve) while its siblings went on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_index: usize,
    pub code: String,
    pub message: String,
}

impl ItemError {
    pub fn new(item_index: usize, cause: &Error) -> Self {
        Self {
            item_index,
            code: cause.code().to_string(),
            message: cause.to_string(),
        }
    }
}

/// Record of one node execution. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node_id: String,
    pub node_name: String,
    /// 0 for the first execution; incremented on every loop revisit
    pub run_index: u32,
    pub status: ResultStatus,
    /// Output per branch; `None` marks a branch that was not activated
    #[serde(default)]
    pub branches: Vec<Option<ItemList>>,
    #[serde(default)]
    pub item_errors: Vec<ItemError>,
    /// The failure, or the recovered failure under `continue_with_empty`
    #[serde(default)]
    pub error: Option<NodeExecutionError>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Items on a branch, empty when absent or inactive.
    pub fn branch(&self, index: usize) -> &[DataItem] {
        self.branches
            .get(index)
            .and_then(|b| b.as_deref())
            .unwrap_or(&[])
    }
}

/// Latest output of a node, shared with snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRunOutput {
    pub node_id: String,
    pub run_index: u32,
    pub branches: Vec<Option<ItemList>>,
}

impl NodeRunOutput {
    pub fn branch(&self, index: usize) -> &[DataItem] {
        self.branches
            .get(index)
            .and_then(|b| b.as_deref())
            .unwrap_or(&[])
    }
}

/// One connection's items waiting at a target input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub input: usize,
    pub items: ItemList,
}

/// A delivery that reached a node after it had already run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateDelivery {
    pub node_id: String,
    pub connection_index: usize,
    pub input: usize,
    pub items: ItemList,
    pub received_at: DateTime<Utc>,
}

/// The node a waiting run is suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingRecord {
    pub node_id: String,
    pub node_name: String,
    pub run_index: u32,
    pub reason: String,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    /// Output the node produced before suspending
    pub branches: Vec<Option<ItemList>>,
    pub since: DateTime<Utc>,
}

/// Why a run ended in `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub item_index: Option<usize>,
}

impl RunFailure {
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::NodeExecution(node_err) => Self::from_node_error(node_err),
            other => Self {
                code: other.code().to_string(),
                message: other.to_string(),
                node_id: None,
                node_name: None,
                item_index: None,
            },
        }
    }

    pub fn from_node_error(err: &NodeExecutionError) -> Self {
        Self {
            code: err.code.clone(),
            message: err.message.clone(),
            node_id: Some(err.node_id.clone()),
            node_name: Some(err.node_name.clone()),
            item_index: err.item_index,
        }
    }
}

/// Short summary of a run, for logs and sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub executed_nodes: usize,
    pub failed_nodes: usize,
    pub item_errors: usize,
    #[serde(default)]
    pub last_node_executed: Option<String>,
}

/// Mutable state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Nodes that received the trigger items
    pub start_nodes: Vec<String>,
    /// Append-only execution log
    pub results: Vec<ExecutionResult>,
    /// Latest output per node id
    pub outputs: HashMap<String, Arc<NodeRunOutput>>,
    /// FIFO of node ids ready to execute
    pub ready: VecDeque<String>,
    /// Deliveries waiting per node, keyed by connection index
    pub pending: HashMap<String, BTreeMap<usize, Delivery>>,
    pub executed: BTreeSet<String>,
    /// Executions per node (the next `run_index`)
    pub run_counts: HashMap<String, u32>,
    /// Revisits per loop target
    pub loop_visits: HashMap<String, u32>,
    /// Opaque per-node state persisted across visits
    pub node_state: HashMap<String, Value>,
    #[serde(default)]
    pub late_deliveries: Vec<LateDelivery>,
    #[serde(default)]
    pub waiting: Option<WaitingRecord>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl RunState {
    pub fn new(run_id: &str, workflow: &Workflow, mode: RunMode) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            start_nodes: Vec::new(),
            results: Vec::new(),
            outputs: HashMap::new(),
            ready: VecDeque::new(),
            pending: HashMap::new(),
            executed: BTreeSet::new(),
            run_counts: HashMap::new(),
            loop_visits: HashMap::new(),
            node_state: HashMap::new(),
            late_deliveries: Vec::new(),
            waiting: None,
            failure: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Append a result and publish its output for expressions.
    pub fn record_result(&mut self, result: ExecutionResult) {
        if result.status != ResultStatus::Error {
            self.outputs.insert(
                result.node_id.clone(),
                Arc::new(NodeRunOutput {
                    node_id: result.node_id.clone(),
                    run_index: result.run_index,
                    branches: result.branches.clone(),
                }),
            );
        }
        self.run_counts
            .insert(result.node_id.clone(), result.run_index + 1);
        self.results.push(result);
    }

    /// `run_index` the next execution of `node_id` gets.
    pub fn next_run_index(&self, node_id: &str) -> u32 {
        self.run_counts.get(node_id).copied().unwrap_or(0)
    }

    /// Store a connection's items at the target. Returns false (and records a
    /// late delivery) when the target already ran.
    pub fn deliver(
        &mut self,
        node_id: &str,
        connection_index: usize,
        input: usize,
        items: ItemList,
    ) -> bool {
        if self.executed.contains(node_id) {
            self.late_deliveries.push(LateDelivery {
                node_id: node_id.to_string(),
                connection_index,
                input,
                items,
                received_at: Utc::now(),
            });
            return false;
        }
        // Repeat deliveries on one connection accumulate in arrival order
        let pending = self.pending.entry(node_id.to_string()).or_default();
        match pending.entry(connection_index) {
            btree_map::Entry::Occupied(mut entry) => entry.get_mut().items.extend(items),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(Delivery { input, items });
            }
        }
        true
    }

    /// Whether the given connections have all delivered to `node_id`.
    pub fn has_all(&self, node_id: &str, connections: &[usize]) -> bool {
        let Some(pending) = self.pending.get(node_id) else {
            return connections.is_empty();
        };
        connections.iter().all(|c| pending.contains_key(c))
    }

    /// Whether anything has been delivered to `node_id`.
    pub fn has_any(&self, node_id: &str) -> bool {
        self.pending
            .get(node_id)
            .map(|p| !p.is_empty())
            .unwrap_or(false)
    }

    /// Readiness of a node that has not executed yet.
    pub fn is_ready(&self, node_id: &str, wait_for_all: bool, required: &[usize]) -> bool {
        if self.executed.contains(node_id) {
            return false;
        }
        if wait_for_all {
            self.has_all(node_id, required)
        } else {
            self.has_any(node_id)
        }
    }

    /// Append to the ready queue unless already queued.
    pub fn enqueue(&mut self, node_id: &str) -> bool {
        if self.ready.iter().any(|n| n == node_id) {
            return false;
        }
        self.ready.push_back(node_id.to_string());
        true
    }

    pub fn take_ready(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Remove and assemble the pending deliveries of `node_id` into one list
    /// per input index, fan-in concatenated in connection order.
    pub fn take_inputs(&mut self, node_id: &str, inputs: usize) -> Vec<ItemList> {
        let mut assembled: Vec<ItemList> = vec![Vec::new(); inputs.max(1)];
        if let Some(pending) = self.pending.remove(node_id) {
            for (_, delivery) in pending {
                if delivery.input >= assembled.len() {
                    assembled.resize(delivery.input + 1, Vec::new());
                }
                assembled[delivery.input].extend(delivery.items);
            }
        }
        assembled
    }

    pub fn mark_executed(&mut self, node_id: &str) {
        self.executed.insert(node_id.to_string());
    }

    /// Make loop-body nodes executable again.
    pub fn rearm<'a>(&mut self, node_ids: impl IntoIterator<Item = &'a str>) {
        for node_id in node_ids {
            self.executed.remove(node_id);
            self.pending.remove(node_id);
        }
    }

    /// Apply a node's requested state change.
    pub fn apply_state(&mut self, node_id: &str, change: StateChange) {
        match change {
            StateChange::Keep => {}
            StateChange::Set(value) => {
                self.node_state.insert(node_id.to_string(), value);
            }
            StateChange::Clear => {
                self.node_state.remove(node_id);
            }
        }
    }

    /// Count a revisit of a loop target and return the new total.
    pub fn count_loop_visit(&mut self, node_id: &str) -> u32 {
        let visits = self.loop_visits.entry(node_id.to_string()).or_insert(0);
        *visits += 1;
        *visits
    }

    /// Immutable view for expression resolution and node execution.
    pub fn snapshot(&self, workflow: &Arc<Workflow>) -> Arc<RunSnapshot> {
        let outputs = workflow
            .nodes
            .iter()
            .filter_map(|n| {
                self.outputs
                    .get(&n.id)
                    .map(|o| (n.display_name().to_string(), o.clone()))
            })
            .collect();

        Arc::new(RunSnapshot {
            run_id: self.run_id.clone(),
            mode: self.mode,
            started_at: self.started_at,
            workflow: workflow.clone(),
            outputs,
        })
    }

    /// Ids of nodes whose latest execution succeeded, in execution order.
    pub fn completed_nodes(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.results
            .iter()
            .filter(|r| r.status == ResultStatus::Success)
            .filter(|r| seen.insert(r.node_id.clone()))
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Latest result for a node.
    pub fn last_result(&self, node_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().rev().find(|r| r.node_id == node_id)
    }

    /// Every result recorded for a node, in execution order.
    pub fn results_for(&self, node_id: &str) -> Vec<&ExecutionResult> {
        self.results.iter().filter(|r| r.node_id == node_id).collect()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            executed_nodes: self.results.len(),
            failed_nodes: self
                .results
                .iter()
                .filter(|r| r.status == ResultStatus::Error)
                .count(),
            item_errors: self.results.iter().map(|r| r.item_errors.len()).sum(),
            last_node_executed: self.results.last().map(|r| r.node_id.clone()),
        }
    }

    /// Serialize a (waiting) run so it can be resumed later.
    pub fn to_resume_token(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_resume_token(token: &str) -> Result<Self> {
        let state: RunState = serde_json::from_str(token)
            .map_err(|e| Error::Parse(format!("Invalid resume token: {}", e)))?;
        Ok(state)
    }
}

/// What a snapshot knows about a node referenced by name.
#[derive(Debug, Clone, Copy)]
pub enum NodeLookup<'a> {
    /// No node with that name in the graph
    Unknown,
    /// The node exists but has no output in this run yet
    NotExecuted,
    Output(&'a NodeRunOutput),
}

/// Read-only view of a run, shared with node tasks.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub workflow: Arc<Workflow>,
    /// Latest output keyed by node display name
    pub outputs: HashMap<String, Arc<NodeRunOutput>>,
}

impl RunSnapshot {
    pub fn lookup(&self, node_name: &str) -> NodeLookup<'_> {
        match self.outputs.get(node_name) {
            Some(output) => NodeLookup::Output(output),
            None if self.workflow.get_node_by_name(node_name).is_some() => {
                NodeLookup::NotExecuted
            }
            None => NodeLookup::Unknown,
        }
    }
}

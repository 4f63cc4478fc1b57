//! Workflow graph type definitions.
//!
//! A workflow is a list of nodes plus an ordered list of connections. The
//! order of `connections` is significant: when several connections feed the
//! same input of a node, their item lists are concatenated in declaration
//! order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A complete workflow graph.
///
/// # Example YAML
///
/// ```yaml
/// id: order-notification
/// name: Order notification
///
/// nodes:
///   - id: start
///     name: Start
///     type: manual_trigger
///   - id: check
///     name: Is Priority
///     type: if
///     parameters:
///       conditions:
///         - left: "{{ $json.priority }}"
///           operator: equals
///           right: high
///
/// connections:
///   - { from: start, to: check }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Stable workflow identifier (used by error-workflow references)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Workflow variables, readable from expressions as `$vars`
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Nodes in the workflow
    pub nodes: Vec<Node>,

    /// Directed connections between node branches and node inputs
    #[serde(default)]
    pub connections: Vec<Connection>,

    /// Run-level settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique, stable node ID within this workflow
    pub id: String,

    /// Unique display name; expressions reference nodes by name
    #[serde(default)]
    pub name: String,

    /// Node type, looked up in the node registry
    #[serde(rename = "type")]
    pub node_type: String,

    /// Node parameters; strings may contain `{{ }}` expressions
    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Failure handling for this node
    #[serde(default)]
    pub on_error: OnErrorAction,

    /// Retry configuration
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Per-invocation timeout in milliseconds (overrides the engine default)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Fail the whole node when any item's parameters fail to resolve,
    /// instead of dropping only that item.
    #[serde(default)]
    pub abort_on_expression_error: bool,

    /// Disabled nodes are recorded as skipped and pass their input through.
    #[serde(default)]
    pub disabled: bool,

    /// Pinned output for testing - when set, the node is not executed and
    /// these items are emitted on branch 0.
    #[serde(default)]
    pub pinned_data: Option<Vec<serde_json::Value>>,
}

impl Node {
    /// Name used in logs and expressions (falls back to the id).
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A directed edge from one node's output branch to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source node id
    pub from: String,

    /// Output branch index on the source node
    #[serde(default)]
    pub branch: usize,

    /// Target node id
    pub to: String,

    /// Input index on the target node
    #[serde(default)]
    pub input: usize,

    /// Main edges must form a DAG; loop edges close intentional cycles.
    #[serde(default)]
    pub kind: ConnectionKind,
}

impl Connection {
    /// Main connection from branch 0 to input 0.
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            branch: 0,
            to: to.to_string(),
            input: 0,
            kind: ConnectionKind::Main,
        }
    }

    pub fn from_branch(mut self, branch: usize) -> Self {
        self.branch = branch;
        self
    }

    pub fn to_input(mut self, input: usize) -> Self {
        self.input = input;
        self
    }

    pub fn as_loop(mut self) -> Self {
        self.kind = ConnectionKind::Loop;
        self
    }
}

/// Connection kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    #[default]
    Main,
    Loop,
}

/// Retry configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum invocation attempts (including the first one)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffType,

    /// Upper bound for a single delay
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

/// What happens when a node fails after retries are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorAction {
    /// Fail the node; the run errors and the error workflow is dispatched
    #[default]
    Propagate,
    /// Treat the failure as a successful run with empty output on every branch
    ContinueWithEmpty,
    /// Isolate failures per item; failed items are recorded, the rest continue
    ContinuePerItem,
}

/// Run-level workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Wall-clock budget for one run in milliseconds (0 = engine default)
    #[serde(default)]
    pub timeout_ms: u64,

    /// Workflow id to run when this workflow fails.
    /// The error workflow receives the failure context as its trigger item.
    #[serde(default)]
    pub error_workflow: Option<String>,

    /// Execute independently-ready nodes concurrently
    #[serde(default)]
    pub parallel_branches: bool,

    /// Maximum concurrent node executions when `parallel_branches` is on
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound on revisits of a loop target within one run
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            error_workflow: None,
            parallel_branches: false,
            max_concurrency: default_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_max_loop_iterations() -> u32 {
    1_000
}

impl Workflow {
    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Get a node by display name.
    pub fn get_node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.display_name() == name)
    }

    /// Position of a node in declaration order.
    pub fn node_position(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// Nodes with no incoming main connection, in declaration order.
    pub fn entry_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| {
                !self
                    .connections
                    .iter()
                    .any(|c| c.kind == ConnectionKind::Main && c.to == n.id)
            })
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Get all node types used in this workflow.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.iter().map(|n| n.node_type.as_str()).collect();
        types.sort();
        types.dedup();
        types
    }
}

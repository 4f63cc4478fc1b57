//! Node trait, data items and the execution contract between nodes and the engine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reference to a binary payload stored outside the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRef {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// One record flowing along a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub json: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<BinaryRef>,
}

impl DataItem {
    pub fn new(json: Value) -> Self {
        Self { json, binary: None }
    }

    /// An item with an empty JSON object.
    pub fn empty() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }

    pub fn with_binary(mut self, binary: BinaryRef) -> Self {
        self.binary = Some(binary);
        self
    }
}

impl From<Value> for DataItem {
    fn from(json: Value) -> Self {
        Self::new(json)
    }
}

/// Ordered list of items on one branch or input.
pub type ItemList = Vec<DataItem>;

/// Build an item list from JSON values.
pub fn items_from_json<I: IntoIterator<Item = Value>>(values: I) -> ItemList {
    values.into_iter().map(DataItem::new).collect()
}

/// When a node with several incoming deliveries becomes ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Every incoming connection from a reachable source must have delivered
    /// (an empty list counts as delivered).
    #[default]
    WaitForAll,
    /// Run as soon as any delivery is present.
    Any,
}

/// How the harness invokes a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// `execute_item` once per item of input 0, parameters resolved per item
    #[default]
    PerItem,
    /// `execute_batch` once with every input list
    Batch,
}

/// Static shape of a node as declared by its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Output branch names; the branch count is `output_names.len()`.
    pub output_names: Vec<String>,
    /// Number of input indices.
    pub inputs: usize,
    pub input_policy: InputPolicy,
    pub mode: ExecutionMode,
}

impl NodeDescriptor {
    /// Single input, single `main` output, per-item execution.
    pub fn per_item() -> Self {
        Self {
            output_names: vec!["main".to_string()],
            inputs: 1,
            input_policy: InputPolicy::WaitForAll,
            mode: ExecutionMode::PerItem,
        }
    }

    /// Single input, single `main` output, batch execution.
    pub fn batch() -> Self {
        Self {
            mode: ExecutionMode::Batch,
            ..Self::per_item()
        }
    }

    pub fn with_outputs<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.output_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs(mut self, inputs: usize) -> Self {
        self.inputs = inputs.max(1);
        self
    }

    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    pub fn outputs(&self) -> usize {
        self.output_names.len().max(1)
    }
}

/// Items produced from one input item by a per-item node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOutput {
    /// (branch index, item) pairs in emission order
    pub emits: Vec<(usize, DataItem)>,
}

impl ItemOutput {
    /// Emit nothing (the item is dropped).
    pub fn none() -> Self {
        Self::default()
    }

    /// Emit one item on branch 0.
    pub fn main(item: DataItem) -> Self {
        Self::to_branch(0, item)
    }

    /// Emit one item on the given branch.
    pub fn to_branch(branch: usize, item: DataItem) -> Self {
        Self {
            emits: vec![(branch, item)],
        }
    }

    pub fn push(&mut self, branch: usize, item: DataItem) {
        self.emits.push((branch, item));
    }
}

/// Change to a node's persisted per-run state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StateChange {
    #[default]
    Keep,
    Set(Value),
    Clear,
}

/// A request to pause the run after this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspend {
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
}

/// Output of one node invocation.
///
/// `branches[i] == None` means branch `i` was not activated and is not
/// routed; `Some(vec![])` is an empty but present output, which is routed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub branches: Vec<Option<ItemList>>,
    pub state: StateChange,
    pub suspend: Option<Suspend>,
}

impl NodeOutput {
    /// All items on branch 0.
    pub fn single(items: ItemList) -> Self {
        Self {
            branches: vec![Some(items)],
            ..Self::default()
        }
    }

    /// Every branch present.
    pub fn from_branches(branches: Vec<ItemList>) -> Self {
        Self {
            branches: branches.into_iter().map(Some).collect(),
            ..Self::default()
        }
    }

    /// `count` present-but-empty branches.
    pub fn empty(count: usize) -> Self {
        Self::from_branches(vec![Vec::new(); count.max(1)])
    }

    /// `count` branches, none activated.
    pub fn inactive(count: usize) -> Self {
        Self {
            branches: vec![None; count.max(1)],
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, index: usize, items: ItemList) -> Self {
        if self.branches.len() <= index {
            self.branches.resize(index + 1, None);
        }
        self.branches[index] = Some(items);
        self
    }

    pub fn with_state(mut self, state: StateChange) -> Self {
        self.state = state;
        self
    }

    pub fn suspended(mut self, suspend: Suspend) -> Self {
        self.suspend = Some(suspend);
        self
    }

    /// Items on a branch, empty when absent or inactive.
    pub fn branch(&self, index: usize) -> &[DataItem] {
        self.branches
            .get(index)
            .and_then(|b| b.as_deref())
            .unwrap_or(&[])
    }

    /// Total number of items across branches.
    pub fn item_count(&self) -> usize {
        self.branches.iter().flatten().map(|b| b.len()).sum()
    }
}

/// Context passed to a node during execution.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: Arc<str>,
    pub workflow_id: Arc<str>,
    pub node_id: Arc<str>,
    pub node_name: Arc<str>,
    /// Current item index (per-item execution)
    pub item_index: Option<usize>,
    /// How many times this node already ran in this run
    pub run_index: u32,
    /// State the node persisted on a previous visit in this run
    pub state: Option<Value>,
}

impl NodeContext {
    pub fn new(run_id: &str, node_id: &str) -> Self {
        Self {
            run_id: Arc::from(run_id),
            workflow_id: Arc::from(""),
            node_id: Arc::from(node_id),
            node_name: Arc::from(node_id),
            item_index: None,
            run_index: 0,
            state: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Arc::from(workflow_id);
        self
    }

    pub fn with_node_name(mut self, name: &str) -> Self {
        self.node_name = Arc::from(name);
        self
    }

    pub fn with_run_index(mut self, run_index: u32) -> Self {
        self.run_index = run_index;
        self
    }

    pub fn with_state(mut self, state: Option<Value>) -> Self {
        self.state = state;
        self
    }

    /// Clone context for a specific item.
    pub fn for_item(&self, index: usize) -> Self {
        Self {
            item_index: Some(index),
            ..self.clone()
        }
    }
}

/// Trait that all node types must implement.
///
/// A node type declares its shape through [`Node::descriptor`] and implements
/// whichever of `execute_item` / `execute_batch` its mode selects.
#[async_trait]
pub trait Node: Send + Sync {
    /// Get the node type name (e.g., "http", "if", "merge").
    fn node_type(&self) -> &str;

    /// Get a description of this node type.
    fn description(&self) -> &str {
        "A workflow node"
    }

    /// Declared inputs, outputs and execution mode.
    ///
    /// Receives the raw (unresolved) parameters so branch counts may depend
    /// on configuration, as with switch cases.
    fn descriptor(&self, _params: &Value) -> NodeDescriptor {
        NodeDescriptor::per_item()
    }

    /// Process one item with parameters resolved against that item.
    async fn execute_item(
        &self,
        _params: &Value,
        _item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        Err(Error::Node(format!(
            "Node type '{}' does not support per-item execution",
            self.node_type()
        )))
    }

    /// Process every input list at once.
    async fn execute_batch(
        &self,
        _params: &Value,
        _inputs: &[ItemList],
        _ctx: &NodeContext,
    ) -> Result<NodeOutput> {
        Err(Error::Node(format!(
            "Node type '{}' does not support batch execution",
            self.node_type()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_output_branch_accessors() {
        let output = NodeOutput::inactive(2).with_branch(1, items_from_json([json!({"a": 1})]));
        assert_eq!(output.branches[0], None);
        assert_eq!(output.branch(0).len(), 0);
        assert_eq!(output.branch(1).len(), 1);
        assert_eq!(output.item_count(), 1);
    }

    #[test]
    fn test_empty_is_present_not_inactive() {
        let output = NodeOutput::empty(2);
        assert_eq!(output.branches, vec![Some(vec![]), Some(vec![])]);
    }

    #[test]
    fn test_descriptor_builders() {
        let d = NodeDescriptor::batch()
            .with_outputs(["loop", "done"])
            .with_inputs(0)
            .with_input_policy(InputPolicy::Any);
        assert_eq!(d.outputs(), 2);
        assert_eq!(d.inputs, 1);
        assert_eq!(d.mode, ExecutionMode::Batch);
        assert_eq!(d.input_policy, InputPolicy::Any);
    }

    #[test]
    fn test_data_item_serde_skips_missing_binary() {
        let item = DataItem::new(json!({"x": 1}));
        let encoded = serde_json::to_value(&item).unwrap();
        assert_eq!(encoded, json!({"json": {"x": 1}}));
    }
}

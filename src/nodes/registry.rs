//! Node registry - manages available node types.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::types::{Node, NodeDescriptor};
use super::{
    ErrorTriggerNode, FilterNode, HttpNode, IfNode, ManualTriggerNode, MergeNode, NoOpNode,
    SetNode, SplitInBatchesNode, StopAndErrorNode, SwitchNode, WaitNode,
};
use crate::error::{Error, Result};

/// Registry of available node types.
///
/// The engine never special-cases a node type; everything it needs to know
/// comes from the registered node's [`NodeDescriptor`].
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
}

impl NodeRegistry {
    /// Create a new registry with the built-in nodes.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(ManualTriggerNode::new()));
        registry.register(Arc::new(ErrorTriggerNode::new()));
        registry.register(Arc::new(NoOpNode::new()));
        registry.register(Arc::new(SetNode::new()));
        registry.register(Arc::new(IfNode::new()));
        registry.register(Arc::new(SwitchNode::new()));
        registry.register(Arc::new(FilterNode::new()));
        registry.register(Arc::new(MergeNode::new()));
        registry.register(Arc::new(SplitInBatchesNode::new()));
        registry.register(Arc::new(WaitNode::new()));
        registry.register(Arc::new(HttpNode::new()));
        registry.register(Arc::new(StopAndErrorNode::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a node type, replacing any previous registration.
    pub fn register(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.node_type().to_string(), node);
    }

    /// Get a node by type name.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_type).cloned()
    }

    /// Get a node by type name, failing for unknown types.
    pub fn require(&self, node_type: &str) -> Result<Arc<dyn Node>> {
        self.get(node_type)
            .ok_or_else(|| Error::Node(format!("Unknown node type: {}", node_type)))
    }

    /// Check if a node type is registered.
    pub fn has(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Declared shape of a node type for the given (raw) parameters.
    pub fn descriptor(&self, node_type: &str, params: &Value) -> Option<NodeDescriptor> {
        self.nodes.get(node_type).map(|n| n.descriptor(params))
    }

    /// List all registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Get descriptions of all registered nodes.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.description()))
            .collect();
        out.sort_unstable_by_key(|(name, _)| *name);
        out
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::types::ExecutionMode;
    use serde_json::json;

    #[test]
    fn test_registry_default_nodes() {
        let registry = NodeRegistry::new();

        for node_type in [
            "manual_trigger",
            "error_trigger",
            "noop",
            "set",
            "if",
            "switch",
            "filter",
            "merge",
            "split_in_batches",
            "wait",
            "http",
            "stop_and_error",
        ] {
            assert!(registry.has(node_type), "missing {}", node_type);
        }
        assert!(!registry.has("nonexistent"));
        assert!(registry.require("nonexistent").is_err());
    }

    #[test]
    fn test_registry_list_is_sorted() {
        let registry = NodeRegistry::new();
        let types = registry.list();
        let mut sorted = types.clone();
        sorted.sort_unstable();
        assert_eq!(types, sorted);
        assert_eq!(types.len(), registry.descriptions().len());
    }

    #[test]
    fn test_registry_descriptor() {
        let registry = NodeRegistry::new();
        let merge = registry.descriptor("merge", &json!({"inputs": 3})).unwrap();
        assert_eq!(merge.inputs, 3);
        assert_eq!(merge.mode, ExecutionMode::Batch);

        let switch = registry
            .descriptor("switch", &json!({"cases": [{"value": 1}]}))
            .unwrap();
        assert_eq!(switch.outputs(), 2);

        assert!(registry.descriptor("ghost", &Value::Null).is_none());
    }

    #[test]
    fn test_registry_empty() {
        let mut registry = NodeRegistry::empty();
        assert!(registry.list().is_empty());
        registry.register(Arc::new(NoOpNode::new()));
        assert_eq!(registry.list(), vec!["noop"]);
    }
}

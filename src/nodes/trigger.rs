//! Trigger nodes - the entry points of a run.
//!
//! Triggers receive the items bound to them by the run request and emit them
//! unchanged. `error_trigger` is the conventional start node of an error
//! workflow and receives the failure payload as its single item.

use async_trait::async_trait;
use serde_json::Value;

use super::types::{ItemList, Node, NodeContext, NodeDescriptor, NodeOutput};
use crate::error::Result;

/// Manual trigger implementation.
pub struct ManualTriggerNode;

impl ManualTriggerNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ManualTriggerNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for ManualTriggerNode {
    fn node_type(&self) -> &str {
        "manual_trigger"
    }

    fn description(&self) -> &str {
        "Start a run with the items supplied by the caller"
    }

    fn descriptor(&self, _params: &Value) -> NodeDescriptor {
        NodeDescriptor::batch()
    }

    async fn execute_batch(
        &self,
        _params: &Value,
        inputs: &[ItemList],
        _ctx: &NodeContext,
    ) -> Result<NodeOutput> {
        Ok(NodeOutput::single(
            inputs.first().cloned().unwrap_or_default(),
        ))
    }
}

/// Error trigger implementation.
pub struct ErrorTriggerNode;

impl ErrorTriggerNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ErrorTriggerNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for ErrorTriggerNode {
    fn node_type(&self) -> &str {
        "error_trigger"
    }

    fn description(&self) -> &str {
        "Start an error workflow with the failed run's error context"
    }

    fn descriptor(&self, _params: &Value) -> NodeDescriptor {
        NodeDescriptor::batch()
    }

    async fn execute_batch(
        &self,
        _params: &Value,
        inputs: &[ItemList],
        _ctx: &NodeContext,
    ) -> Result<NodeOutput> {
        Ok(NodeOutput::single(
            inputs.first().cloned().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::types::items_from_json;
    use serde_json::json;

    #[tokio::test]
    async fn test_manual_trigger_emits_bound_items() {
        let items = items_from_json([json!({"a": 1}), json!({"a": 2})]);
        let out = ManualTriggerNode::new()
            .execute_batch(
                &Value::Null,
                &[items.clone()],
                &NodeContext::new("run-1", "start"),
            )
            .await
            .unwrap();
        assert_eq!(out.branch(0), items.as_slice());
    }

    #[tokio::test]
    async fn test_trigger_without_items_emits_empty_branch() {
        let out = ErrorTriggerNode::new()
            .execute_batch(&Value::Null, &[], &NodeContext::new("run-1", "on-error"))
            .await
            .unwrap();
        assert_eq!(out.branches, vec![Some(vec![])]);
    }
}

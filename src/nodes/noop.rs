//! No-op node - pass every item through unchanged.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::types::{DataItem, ItemOutput, Node, NodeContext};
use crate::error::Result;

/// No-op node implementation.
pub struct NoOpNode;

impl NoOpNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoOpNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for NoOpNode {
    fn node_type(&self) -> &str {
        "noop"
    }

    fn description(&self) -> &str {
        "Pass items through unchanged"
    }

    async fn execute_item(
        &self,
        _params: &Value,
        item: &DataItem,
        ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        debug!(
            node = %ctx.node_name,
            item_index = ?ctx.item_index,
            "noop passing item through"
        );
        Ok(ItemOutput::main(item.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_passes_item_through() {
        let item = DataItem::new(json!({"n": 1}));
        let out = NoOpNode::new()
            .execute_item(&Value::Null, &item, &NodeContext::new("run-1", "pass"))
            .await
            .unwrap();
        assert_eq!(out, ItemOutput::main(item));
    }
}

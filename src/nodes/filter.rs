//! Filter node - keep only the items that satisfy the conditions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::condition::{evaluate_all, Combine, Condition};
use super::types::{DataItem, ItemOutput, Node, NodeContext};
use crate::error::{Error, Result};

/// Filter node implementation.
pub struct FilterNode;

impl FilterNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FilterNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct FilterConfig {
    conditions: Vec<Condition>,
    #[serde(default)]
    combine: Combine,
}

#[async_trait]
impl Node for FilterNode {
    fn node_type(&self) -> &str {
        "filter"
    }

    fn description(&self) -> &str {
        "Drop items that do not satisfy the conditions"
    }

    async fn execute_item(
        &self,
        params: &Value,
        item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: FilterConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid filter config: {}", e)))?;

        if config.conditions.is_empty() {
            return Err(Error::Node(
                "Filter node requires at least one condition".to_string(),
            ));
        }

        if evaluate_all(&config.conditions, config.combine)? {
            Ok(ItemOutput::main(item.clone()))
        } else {
            Ok(ItemOutput::none())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_filter_keeps_matching_item() {
        let node = FilterNode::new();
        let params = json!({
            "conditions": [{"left": 30, "operator": "gte", "right": 18}]
        });
        let item = DataItem::new(json!({"age": 30}));
        let out = node
            .execute_item(&params, &item, &NodeContext::new("run-1", "adults"))
            .await
            .unwrap();
        assert_eq!(out, ItemOutput::main(item));
    }

    #[tokio::test]
    async fn test_filter_drops_non_matching_item() {
        let node = FilterNode::new();
        let params = json!({
            "combine": "any",
            "conditions": [
                {"left": "inactive", "operator": "equals", "right": "active"},
                {"left": 12, "operator": "gte", "right": 18}
            ]
        });
        let out = node
            .execute_item(&params, &DataItem::empty(), &NodeContext::new("run-1", "adults"))
            .await
            .unwrap();
        assert!(out.emits.is_empty());
    }
}

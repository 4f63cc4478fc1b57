//! IF node - route each item to the `true` or `false` branch.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::condition::{evaluate_all, Combine, Condition};
use super::types::{DataItem, ItemOutput, Node, NodeContext, NodeDescriptor};
use crate::error::{Error, Result};

/// Branch index for items that matched.
pub const TRUE_BRANCH: usize = 0;
/// Branch index for items that did not match.
pub const FALSE_BRANCH: usize = 1;

/// IF node implementation.
pub struct IfNode;

impl IfNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IfNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IfConfig {
    conditions: Vec<Condition>,
    #[serde(default)]
    combine: Combine,
}

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "if"
    }

    fn description(&self) -> &str {
        "Route items to the true or false branch by evaluating conditions"
    }

    fn descriptor(&self, _params: &Value) -> NodeDescriptor {
        NodeDescriptor::per_item().with_outputs(["true", "false"])
    }

    async fn execute_item(
        &self,
        params: &Value,
        item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: IfConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid if config: {}", e)))?;

        if config.conditions.is_empty() {
            return Err(Error::Node(
                "IF node requires at least one condition".to_string(),
            ));
        }

        let branch = if evaluate_all(&config.conditions, config.combine)? {
            TRUE_BRANCH
        } else {
            FALSE_BRANCH
        };

        Ok(ItemOutput::to_branch(branch, item.clone()))
    }
}

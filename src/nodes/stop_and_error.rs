//! Stop-and-error node - fail deliberately with a configured message.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::types::{DataItem, ItemOutput, Node, NodeContext};
use crate::error::{Error, Result};

/// Stop-and-error node implementation.
pub struct StopAndErrorNode;

impl StopAndErrorNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StopAndErrorNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct StopConfig {
    #[serde(default = "default_message")]
    message: String,
}

fn default_message() -> String {
    "Workflow stopped".to_string()
}

#[async_trait]
impl Node for StopAndErrorNode {
    fn node_type(&self) -> &str {
        "stop_and_error"
    }

    fn description(&self) -> &str {
        "Fail the node with a custom error message"
    }

    async fn execute_item(
        &self,
        params: &Value,
        _item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: StopConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid stop_and_error config: {}", e)))?;
        Err(Error::Node(config.message))
    }
}

//! Switch node - multi-way branch selection.
//!
//! Each case gets its own numbered output; an optional trailing `fallback`
//! output receives items that matched no case.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::condition::evaluate;
use super::types::{DataItem, ItemOutput, Node, NodeContext, NodeDescriptor};
use crate::error::{Error, Result};

/// Switch node implementation.
pub struct SwitchNode;

impl SwitchNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwitchNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SwitchConfig {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    cases: Vec<SwitchCase>,
    #[serde(default = "default_fallback")]
    fallback_output: bool,
    /// Send the item to every matching case instead of the first one
    #[serde(default)]
    all_matching: bool,
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    #[serde(default = "default_operator")]
    operator: String,
    #[serde(default)]
    value: Value,
}

fn default_operator() -> String {
    "equals".to_string()
}

fn default_fallback() -> bool {
    true
}

/// Number of cases and whether a fallback output exists, read from raw params.
fn shape(params: &Value) -> (usize, bool) {
    let cases = params
        .get("cases")
        .and_then(|c| c.as_array())
        .map(|c| c.len())
        .unwrap_or(0);
    let fallback = params
        .get("fallback_output")
        .and_then(|f| f.as_bool())
        .unwrap_or(true);
    (cases, fallback)
}

#[async_trait]
impl Node for SwitchNode {
    fn node_type(&self) -> &str {
        "switch"
    }

    fn description(&self) -> &str {
        "Route items to the output of the first matching case"
    }

    fn descriptor(&self, params: &Value) -> NodeDescriptor {
        let (cases, fallback) = shape(params);
        let mut names: Vec<String> = (0..cases).map(|i| i.to_string()).collect();
        if fallback {
            names.push("fallback".to_string());
        }
        if names.is_empty() {
            names.push("fallback".to_string());
        }
        NodeDescriptor::per_item().with_outputs(names)
    }

    async fn execute_item(
        &self,
        params: &Value,
        item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: SwitchConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid switch config: {}", e)))?;

        if config.cases.is_empty() && !config.fallback_output {
            return Err(Error::Node(
                "Switch node requires at least one case or a fallback output".to_string(),
            ));
        }

        let mut output = ItemOutput::none();
        for (idx, case) in config.cases.iter().enumerate() {
            if evaluate(&config.value, &case.operator, &case.value)? {
                output.push(idx, item.clone());
                if !config.all_matching {
                    break;
                }
            }
        }

        if output.emits.is_empty() && config.fallback_output {
            output.push(config.cases.len(), item.clone());
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext::new("run-1", "route")
    }

    #[tokio::test]
    async fn test_switch_first_match_wins() {
        let node = SwitchNode::new();
        let params = json!({
            "value": 75,
            "cases": [
                {"operator": "gte", "value": 90},
                {"operator": "gte", "value": 50},
                {"operator": "gte", "value": 0}
            ]
        });

        let out = node
            .execute_item(&params, &DataItem::empty(), &ctx())
            .await
            .unwrap();
        assert_eq!(out.emits.len(), 1);
        assert_eq!(out.emits[0].0, 1);
    }

    #[tokio::test]
    async fn test_switch_all_matching() {
        let node = SwitchNode::new();
        let params = json!({
            "value": 75,
            "all_matching": true,
            "cases": [
                {"operator": "gte", "value": 90},
                {"operator": "gte", "value": 50},
                {"operator": "gte", "value": 0}
            ]
        });

        let out = node
            .execute_item(&params, &DataItem::empty(), &ctx())
            .await
            .unwrap();
        let branches: Vec<usize> = out.emits.iter().map(|(b, _)| *b).collect();
        assert_eq!(branches, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_switch_fallback() {
        let node = SwitchNode::new();
        let params = json!({
            "value": "purple",
            "cases": [{"value": "red"}, {"value": "green"}]
        });

        let out = node
            .execute_item(&params, &DataItem::empty(), &ctx())
            .await
            .unwrap();
        assert_eq!(out.emits[0].0, 2);
    }

    #[tokio::test]
    async fn test_switch_without_fallback_drops_unmatched() {
        let node = SwitchNode::new();
        let params = json!({
            "value": "purple",
            "fallback_output": false,
            "cases": [{"value": "red"}]
        });

        let out = node
            .execute_item(&params, &DataItem::empty(), &ctx())
            .await
            .unwrap();
        assert!(out.emits.is_empty());
    }

    #[test]
    fn test_switch_descriptor_counts_cases() {
        let node = SwitchNode::new();
        let d = node.descriptor(&json!({"cases": [{"value": 1}, {"value": 2}]}));
        assert_eq!(d.output_names, vec!["0", "1", "fallback"]);

        let d = node.descriptor(&json!({"cases": [{"value": 1}], "fallback_output": false}));
        assert_eq!(d.outputs(), 1);
    }
}

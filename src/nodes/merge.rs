//! Merge node - join the item lists arriving on several inputs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{
    DataItem, InputPolicy, ItemList, Node, NodeContext, NodeDescriptor, NodeOutput,
};
use crate::error::{Error, Result};

/// Merge node implementation.
pub struct MergeNode;

impl MergeNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MergeNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct MergeConfig {
    #[serde(default = "default_mode")]
    mode: String, // append | combine_by_index | pass_through
    /// Input whose items `pass_through` emits
    #[serde(default)]
    output_input: usize,
}

fn default_mode() -> String {
    "append".to_string()
}

const DEFAULT_INPUTS: usize = 2;

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }

    fn description(&self) -> &str {
        "Merge inputs by append, combine_by_index, or pass_through"
    }

    fn descriptor(&self, params: &Value) -> NodeDescriptor {
        let inputs = params
            .get("inputs")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_INPUTS);
        let policy = match params.get("wait").and_then(|v| v.as_str()) {
            Some("any") => InputPolicy::Any,
            _ => InputPolicy::WaitForAll,
        };
        NodeDescriptor::batch()
            .with_inputs(inputs)
            .with_input_policy(policy)
    }

    async fn execute_batch(
        &self,
        params: &Value,
        inputs: &[ItemList],
        _ctx: &NodeContext,
    ) -> Result<NodeOutput> {
        let config: MergeConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid merge config: {}", e)))?;

        let merged = match config.mode.as_str() {
            "append" => merge_append(inputs),
            "combine_by_index" => merge_combine_by_index(inputs)?,
            "pass_through" => inputs.get(config.output_input).cloned().unwrap_or_default(),
            _ => {
                return Err(Error::Node(format!(
                    "Invalid merge mode '{}', expected append/combine_by_index/pass_through",
                    config.mode
                )))
            }
        };

        Ok(NodeOutput::single(merged))
    }
}

fn merge_append(inputs: &[ItemList]) -> ItemList {
    inputs.iter().flatten().cloned().collect()
}

/// Pair the i-th item of every input into one object; later inputs win on
/// key conflicts. Stops at the shortest input.
fn merge_combine_by_index(inputs: &[ItemList]) -> Result<ItemList> {
    let min_len = inputs.iter().map(|i| i.len()).min().unwrap_or(0);
    let mut combined = Vec::with_capacity(min_len);

    for idx in 0..min_len {
        let mut out = Map::new();
        let mut binary = None;
        for input in inputs {
            let item = &input[idx];
            match &item.json {
                Value::Object(map) => {
                    for (k, v) in map {
                        out.insert(k.clone(), v.clone());
                    }
                }
                other => {
                    return Err(Error::Node(format!(
                        "merge combine_by_index mode requires object items, found {}",
                        type_name(other)
                    )))
                }
            }
            if item.binary.is_some() {
                binary = item.binary.clone();
            }
        }
        combined.push(DataItem {
            json: Value::Object(out),
            binary,
        });
    }

    Ok(combined)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::types::items_from_json;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext::new("run-1", "merge")
    }

    #[tokio::test]
    async fn test_merge_append() {
        let inputs = vec![
            items_from_json([json!({"n": 1}), json!({"n": 2})]),
            items_from_json([json!({"n": 3})]),
        ];
        let out = MergeNode::new()
            .execute_batch(&json!({"mode": "append"}), &inputs, &ctx())
            .await
            .unwrap();
        let ns: Vec<i64> = out
            .branch(0)
            .iter()
            .map(|i| i.json["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_merge_append_with_empty_input() {
        let inputs = vec![items_from_json([json!({"n": 1})]), vec![]];
        let out = MergeNode::new()
            .execute_batch(&json!({}), &inputs, &ctx())
            .await
            .unwrap();
        assert_eq!(out.item_count(), 1);
    }

    #[tokio::test]
    async fn test_merge_combine_by_index() {
        let inputs = vec![
            items_from_json([json!({"x": 1}), json!({"x": 2}), json!({"x": 3})]),
            items_from_json([json!({"y": "a"}), json!({"y": "b"})]),
        ];
        let out = MergeNode::new()
            .execute_batch(&json!({"mode": "combine_by_index"}), &inputs, &ctx())
            .await
            .unwrap();
        assert_eq!(out.branch(0).len(), 2);
        assert_eq!(out.branch(0)[1].json, json!({"x": 2, "y": "b"}));
    }

    #[tokio::test]
    async fn test_merge_combine_rejects_non_objects() {
        let inputs = vec![items_from_json([json!(1)]), items_from_json([json!({"y": 1})])];
        let err = MergeNode::new()
            .execute_batch(&json!({"mode": "combine_by_index"}), &inputs, &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("found number"));
    }

    #[tokio::test]
    async fn test_merge_pass_through() {
        let inputs = vec![
            items_from_json([json!({"left": true})]),
            items_from_json([json!({"right": true})]),
        ];
        let out = MergeNode::new()
            .execute_batch(
                &json!({"mode": "pass_through", "output_input": 1}),
                &inputs,
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out.branch(0)[0].json, json!({"right": true}));
    }

    #[test]
    fn test_merge_descriptor_reads_inputs_and_wait() {
        let d = MergeNode::new().descriptor(&json!({"inputs": 3, "wait": "any"}));
        assert_eq!(d.inputs, 3);
        assert_eq!(d.input_policy, InputPolicy::Any);

        let d = MergeNode::new().descriptor(&Value::Null);
        assert_eq!(d.inputs, 2);
        assert_eq!(d.input_policy, InputPolicy::WaitForAll);
    }
}

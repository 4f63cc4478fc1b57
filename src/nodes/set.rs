//! Set node - assign fields on each item.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{DataItem, ItemOutput, Node, NodeContext};
use crate::error::{Error, Result};

/// Set node implementation.
pub struct SetNode;

impl SetNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SetNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SetConfig {
    /// Dotted path -> value. Values arrive with expressions already resolved.
    #[serde(default)]
    values: Map<String, Value>,
    /// Start from an empty object instead of the incoming item's json
    #[serde(default)]
    keep_only_set: bool,
}

#[async_trait]
impl Node for SetNode {
    fn node_type(&self) -> &str {
        "set"
    }

    fn description(&self) -> &str {
        "Set or overwrite fields on each item"
    }

    async fn execute_item(
        &self,
        params: &Value,
        item: &DataItem,
        _ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: SetConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid set config: {}", e)))?;

        let mut output = if config.keep_only_set {
            Map::new()
        } else {
            match &item.json {
                Value::Object(map) => map.clone(),
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            }
        };

        for (path, value) in config.values {
            set_path_value(&mut output, &path, value);
        }

        let mut result = DataItem::new(Value::Object(output));
        if !config.keep_only_set {
            result.binary = item.binary.clone();
        }
        Ok(ItemOutput::main(result))
    }
}

fn set_path_value(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return;
    }

    let mut current = root;
    for segment in &segments[..segments.len() - 1] {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }

        if let Some(map) = entry.as_object_mut() {
            current = map;
        } else {
            return;
        }
    }

    current.insert(segments[segments.len() - 1].to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> NodeContext {
        NodeContext::new("run-1", "assign")
    }

    #[tokio::test]
    async fn test_set_merges_into_item() {
        let node = SetNode::new();
        let params = json!({"values": {"status": "processed"}});
        let item = DataItem::new(json!({"order_id": "A-1"}));

        let out = node.execute_item(&params, &item, &ctx()).await.unwrap();
        assert_eq!(
            out.emits[0].1.json,
            json!({"order_id": "A-1", "status": "processed"})
        );
    }

    #[tokio::test]
    async fn test_set_nested_path() {
        let node = SetNode::new();
        let params = json!({"values": {"meta.source": "itemflow", "meta.raw": {"a": 1}}});
        let item = DataItem::new(json!({"meta": "overwritten"}));

        let out = node.execute_item(&params, &item, &ctx()).await.unwrap();
        let json = &out.emits[0].1.json;
        assert_eq!(json["meta"]["source"], "itemflow");
        assert_eq!(json["meta"]["raw"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_set_keep_only_set() {
        let node = SetNode::new();
        let params = json!({"keep_only_set": true, "values": {"id": 7}});
        let item = DataItem::new(json!({"id": 1, "secret": "x"}));

        let out = node.execute_item(&params, &item, &ctx()).await.unwrap();
        assert_eq!(out.emits[0].1.json, json!({"id": 7}));
    }
}

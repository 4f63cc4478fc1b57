//! Workflow definition parser (YAML and JSON).

use std::path::Path;

use super::types::Workflow;
use crate::error::{Error, Result};

/// Parse a workflow from a YAML string.
pub fn parse_workflow(yaml: &str) -> Result<Workflow> {
    if yaml.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let workflow: Workflow = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid YAML: {}", msg))
        }
    })?;
    Ok(normalize(workflow))
}

/// Parse a workflow from a JSON string.
pub fn parse_workflow_json(json: &str) -> Result<Workflow> {
    if json.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let workflow: Workflow = serde_json::from_str(json).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid JSON: {}", msg))
        }
    })?;
    Ok(normalize(workflow))
}

/// Parse a workflow file; `.json` files are read as JSON, everything else as YAML.
pub fn parse_workflow_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow(&content),
    }
}

/// Fill in defaults that depend on other fields.
fn normalize(mut workflow: Workflow) -> Workflow {
    if workflow.name.is_empty() {
        workflow.name = workflow.id.clone();
    }
    for node in &mut workflow.nodes {
        if node.name.is_empty() {
            node.name = node.id.clone();
        }
    }
    workflow
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{BackoffType, ConnectionKind, OnErrorAction};

    #[test]
    fn test_parse_simple_workflow() {
        let yaml = r#"
id: test-workflow
name: Test workflow

nodes:
  - id: start
    type: manual_trigger
  - id: check
    name: Is High
    type: if
    parameters:
      conditions:
        - left: "{{ $json.priority }}"
          operator: equals
          right: high

connections:
  - from: start
    to: check
"#;

        let workflow = parse_workflow(yaml).unwrap();
        assert_eq!(workflow.name, "Test workflow");
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.nodes[0].name, "start");
        assert_eq!(workflow.nodes[1].name, "Is High");
        assert_eq!(workflow.connections[0].branch, 0);
        assert_eq!(workflow.connections[0].kind, ConnectionKind::Main);
    }

    #[test]
    fn test_parse_policies_and_loop_edges() {
        let yaml = r#"
id: policies
nodes:
  - id: batches
    type: split_in_batches
  - id: call
    type: http
    on_error: continue_per_item
    retry:
      max_attempts: 5
      delay_ms: 10
      backoff: exponential
connections:
  - { from: batches, branch: 0, to: call }
  - { from: call, to: batches, kind: loop }
settings:
  error_workflow: on-failure
  timeout_ms: 5000
"#;

        let workflow = parse_workflow(yaml).unwrap();
        let call = workflow.get_node("call").unwrap();
        assert_eq!(call.on_error, OnErrorAction::ContinuePerItem);
        let retry = call.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff, BackoffType::Exponential);
        assert_eq!(workflow.connections[1].kind, ConnectionKind::Loop);
        assert_eq!(
            workflow.settings.error_workflow.as_deref(),
            Some("on-failure")
        );
        assert_eq!(workflow.settings.timeout_ms, 5000);
    }

    #[test]
    fn test_parse_json_workflow() {
        let json = r#"{
            "id": "json-wf",
            "nodes": [{"id": "a", "type": "noop"}],
            "connections": []
        }"#;
        let workflow = parse_workflow_json(json).unwrap();
        assert_eq!(workflow.name, "json-wf");
        assert_eq!(workflow.nodes[0].name, "a");
    }

    #[test]
    fn test_parse_empty_workflow() {
        let result = parse_workflow("");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .to_lowercase()
            .contains("empty workflow"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_workflow("id: [broken");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .to_lowercase()
            .contains("invalid yaml"));
    }

    #[test]
    fn test_parse_missing_required_field_id() {
        let yaml = r#"
nodes:
  - id: step1
    type: noop
"#;
        let result = parse_workflow(yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Missing required field: id"));
    }
}

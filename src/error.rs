//! Error types for itemflow.
//!
//! Every variant carries a stable machine code so callers (and error
//! workflows) can branch on the failure class without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for itemflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// itemflow error types.
#[derive(Error, Debug)]
pub enum Error {
    /// An expression referenced a node that has not produced output in this run.
    #[error("Unresolved reference: node '{node}' has not produced output in this run")]
    UnresolvedReference { node: String },

    /// Any other expression failure (syntax, unknown node name).
    #[error("Expression error: {0}")]
    Expression(String),

    /// A node's action failed and the failure left the harness.
    #[error("{0}")]
    NodeExecution(NodeExecutionError),

    /// The graph is malformed; raised before any node executes.
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    /// The run exceeded its wall-clock budget.
    #[error("Run timed out after {timeout_ms}ms")]
    RunTimeout { timeout_ms: u64 },

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Raised by node implementations (bad parameters, remote failure).
    #[error("Node error: {0}")]
    Node(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnresolvedReference { .. } => "UNRESOLVED_REFERENCE",
            Error::Expression(_) => "EXPRESSION_ERROR",
            Error::NodeExecution(_) => "NODE_EXECUTION_ERROR",
            Error::GraphIntegrity(_) => "GRAPH_INTEGRITY_ERROR",
            Error::RunTimeout { .. } => "RUN_TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Node(_) => "NODE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Integrity, cancellation and expression failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::GraphIntegrity(_)
                | Error::Cancelled(_)
                | Error::UnresolvedReference { .. }
                | Error::Expression(_)
                | Error::Parse(_)
                | Error::Config(_)
        )
    }

    /// Convert to a JSON error envelope.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<NodeExecutionError> for Error {
    fn from(err: NodeExecutionError) -> Self {
        Error::NodeExecution(err)
    }
}

/// A node's action failed.
///
/// Produced by the harness from whatever the node implementation returned
/// (or from a timeout / panic), so callers only ever see one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecutionError {
    pub node_id: String,
    pub node_name: String,
    /// Index of the failing item for per-item nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_index: Option<usize>,
    /// Code of the underlying error.
    pub code: String,
    pub message: String,
    /// Invocation attempts made before giving up.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl NodeExecutionError {
    pub fn new(node_id: &str, node_name: &str, cause: &Error) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            item_index: None,
            code: cause.code().to_string(),
            message: cause.to_string(),
            attempts: 1,
        }
    }

    pub fn with_item(mut self, index: usize) -> Self {
        self.item_index = Some(index);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_index {
            Some(idx) => write!(
                f,
                "Node '{}' failed at item {}: {}",
                self.node_name, idx, self.message
            ),
            None => write!(f, "Node '{}' failed: {}", self.node_name, self.message),
        }
    }
}

impl std::error::Error for NodeExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::UnresolvedReference {
                node: "Fetch".into()
            }
            .code(),
            "UNRESOLVED_REFERENCE"
        );
        assert_eq!(
            Error::GraphIntegrity("x".into()).code(),
            "GRAPH_INTEGRITY_ERROR"
        );
        assert_eq!(Error::RunTimeout { timeout_ms: 5 }.code(), "RUN_TIMEOUT");
    }

    #[test]
    fn test_node_execution_error_display() {
        let cause = Error::Node("boom".into());
        let err = NodeExecutionError::new("n1", "Fetch Orders", &cause).with_item(2);
        assert_eq!(err.code, "NODE_ERROR");
        assert_eq!(
            err.to_string(),
            "Node 'Fetch Orders' failed at item 2: Node error: boom"
        );

        let wrapped: Error = err.into();
        assert_eq!(wrapped.code(), "NODE_EXECUTION_ERROR");
        assert_eq!(wrapped.to_json()["error"]["code"], "NODE_EXECUTION_ERROR");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Node("timeout".into()).is_retryable());
        assert!(!Error::GraphIntegrity("dangling".into()).is_retryable());
        assert!(!Error::UnresolvedReference { node: "a".into() }.is_retryable());
    }
}

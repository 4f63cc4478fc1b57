//! Workflow definition, parsing, and validation.
//!
//! Workflows are defined in YAML (or JSON) and consist of:
//! - Nodes: the steps to execute, with per-node error policy
//! - Connections: ordered edges from a node's output branch to a node's input
//! - Settings: run-level configuration (timeout, error workflow, parallelism)

mod parser;
mod types;
mod validator;

pub use parser::{parse_workflow, parse_workflow_file, parse_workflow_json};
pub use types::*;
pub use validator::{
    check_required_inputs_reachable, reachable_from, validate_graph, validate_workflow,
};

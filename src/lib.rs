//! itemflow - item-based workflow execution engine
//!
//! A workflow is a directed graph of nodes. Nodes receive ordered lists of
//! items, transform them, and emit them on one or more output branches;
//! connections carry each branch to the inputs of downstream nodes. The
//! [`Walker`] drives a run through the graph, the node executor harness
//! applies per-node timeout, retry and error policy, and expressions in node
//! parameters read the output of nodes that already ran.
//!
//! ## Example
//!
//! ```yaml
//! id: order-notification
//! name: Order notification
//!
//! nodes:
//!   - id: start
//!     type: manual_trigger
//!   - id: fetch
//!     name: Fetch Orders
//!     type: http
//!     parameters:
//!       url: https://api.example.com/orders
//!     retry: { max_attempts: 3, delay_ms: 500, backoff: exponential }
//!   - id: big
//!     type: if
//!     parameters:
//!       conditions:
//!         - { left: "{{ $json.total }}", operator: gt, right: 100 }
//!   - id: tag
//!     type: set
//!     parameters:
//!       values: { priority: high, source: "{{ $node[\"Fetch Orders\"].json.region }}" }
//!
//! connections:
//!   - { from: start, to: fetch }
//!   - { from: fetch, to: big }
//!   - { from: big, branch: 0, to: tag }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod nodes;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use config::Config;
pub use engine::{RunReport, RunRequest, RunState, RunStatus, Walker};
pub use error::{Error, Result};
pub use nodes::NodeRegistry;
pub use workflow::{parse_workflow, Workflow};

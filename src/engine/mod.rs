//! Execution engine for workflows.

mod cancel;
mod context;
pub mod expression;
mod harness;
mod policy;
pub mod router;
mod walker;

pub use cancel::{CancelHandle, CancelRegistry};
pub use context::{
    Delivery, ExecutionResult, ItemError, LateDelivery, NodeLookup, NodeRunOutput, ResultStatus,
    RunFailure, RunMode, RunSnapshot, RunState, RunStatus, RunSummary, WaitingRecord,
};
pub use expression::{ExpressionError, ExpressionScope};
pub use harness::{execute, execute_detached, HarnessResult, Interrupted, NodeJob, NodeSuccess};
pub use policy::{remaining_until, retry_delay, ErrorPolicy, FailureDecision};
pub use router::{route, Route, RoutingTable};
pub use walker::{
    error_payload, InMemoryCatalog, RunReport, RunRequest, Walker, WorkflowCatalog,
};

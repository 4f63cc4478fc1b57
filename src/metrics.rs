//! Engine metrics.
//!
//! Recorded through the `metrics` facade; the embedding application decides
//! whether and where to export them by installing a recorder.
//!
//! ## Metrics
//!
//! ### Counters
//! - `itemflow_runs_total` - Finished runs by status and mode
//! - `itemflow_nodes_executed_total` - Node executions by node_type and status
//! - `itemflow_node_retries_total` - Retry attempts by node_type
//! - `itemflow_item_errors_total` - Items recorded as failed by node_type
//! - `itemflow_error_workflows_total` - Error workflow dispatches by outcome
//!
//! ### Histograms
//! - `itemflow_run_duration_seconds` - Run duration
//! - `itemflow_node_duration_seconds` - Node execution duration by node_type
//!
//! ### Gauges
//! - `itemflow_active_runs` - Runs currently executing

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Run Metrics
// =============================================================================

/// Record a finished (or suspended) run.
pub fn record_run(status: &str, mode: &str) {
    counter!(
        "itemflow_runs_total",
        "status" => status.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
}

/// Record run duration.
pub fn record_run_duration(duration: Duration, workflow_id: &str) {
    histogram!(
        "itemflow_run_duration_seconds",
        "workflow" => workflow_id.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment active runs gauge.
pub fn inc_active_runs() {
    gauge!("itemflow_active_runs").increment(1.0);
}

/// Decrement active runs gauge.
pub fn dec_active_runs() {
    gauge!("itemflow_active_runs").decrement(1.0);
}

/// Record an error workflow dispatch.
pub fn record_error_workflow(outcome: &str) {
    counter!(
        "itemflow_error_workflows_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Node Metrics
// =============================================================================

/// Record a node execution.
pub fn record_node_execution(node_type: &str, status: &str) {
    counter!(
        "itemflow_nodes_executed_total",
        "node_type" => node_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record node execution duration.
pub fn record_node_duration(duration: Duration, node_type: &str) {
    histogram!(
        "itemflow_node_duration_seconds",
        "node_type" => node_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry attempt.
pub fn record_node_retry(node_type: &str) {
    counter!(
        "itemflow_node_retries_total",
        "node_type" => node_type.to_string()
    )
    .increment(1);
}

/// Record items that failed while their siblings continued.
pub fn record_item_errors(node_type: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "itemflow_item_errors_total",
        "node_type" => node_type.to_string()
    )
    .increment(count as u64);
}

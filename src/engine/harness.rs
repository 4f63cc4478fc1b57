//! Node executor harness.
//!
//! Runs one node invocation end to end: resolves parameters against the run
//! snapshot, calls the node once per item (or once per batch) under the
//! node's timeout and retry policy, and turns every kind of failure into a
//! [`NodeExecutionError`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

use super::cancel::CancelHandle;
use super::context::{ItemError, RunSnapshot};
use super::expression::{contains_expression, resolve_params, ExpressionScope};
use super::policy::{remaining_until, ErrorPolicy, FailureDecision};
use crate::error::{Error, NodeExecutionError, Result};
use crate::metrics;
use crate::nodes::{ExecutionMode, ItemList, Node, NodeContext, NodeDescriptor, NodeOutput};

/// Everything needed to execute one node once. Owns its data so it can be
/// moved into a spawned task.
#[derive(Clone)]
pub struct NodeJob {
    pub node: Arc<dyn Node>,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    /// Parameters as written in the workflow (expressions unresolved)
    pub params: Value,
    pub descriptor: NodeDescriptor,
    /// One item list per input index
    pub inputs: Vec<ItemList>,
    pub snapshot: Arc<RunSnapshot>,
    pub context: NodeContext,
    pub policy: ErrorPolicy,
    /// Per-invocation timeout
    pub timeout: Duration,
    pub abort_on_expression_error: bool,
    /// Run deadline, used to refuse retries that cannot finish in time
    pub deadline: Option<Instant>,
}

/// A node execution that produced output.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSuccess {
    pub output: NodeOutput,
    pub item_errors: Vec<ItemError>,
    pub attempts: u32,
    /// Failure that `continue_with_empty` turned into empty output
    pub recovered: Option<NodeExecutionError>,
}

pub type HarnessResult = std::result::Result<NodeSuccess, NodeExecutionError>;

/// Why a detached execution stopped being awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    DeadlineExceeded,
}

enum Attempted<T> {
    Done {
        value: T,
        attempts: u32,
    },
    Failed {
        error: Error,
        attempts: u32,
        decision: FailureDecision,
    },
}

impl NodeJob {
    fn failure(&self, cause: &Error) -> NodeExecutionError {
        NodeExecutionError::new(&self.node_id, &self.node_name, cause)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| remaining_until(d).unwrap_or(Duration::ZERO))
    }

    fn empty_output(&self, recovered: NodeExecutionError, attempts: u32) -> NodeSuccess {
        warn!(
            "Node '{}' failed, continuing with empty output: {}",
            self.node_name, recovered
        );
        NodeSuccess {
            output: NodeOutput::empty(self.descriptor.outputs()),
            item_errors: Vec::new(),
            attempts,
            recovered: Some(recovered),
        }
    }
}

/// Execute a node in place.
#[instrument(
    name = "node.execute",
    skip(job),
    fields(
        node_id = %job.node_id,
        node_type = %job.node_type,
        run_id = %job.context.run_id,
        run_index = job.context.run_index,
    )
)]
pub async fn execute(job: NodeJob) -> HarnessResult {
    match job.descriptor.mode {
        ExecutionMode::PerItem => execute_per_item(&job).await,
        ExecutionMode::Batch => execute_batch(&job).await,
    }
}

/// Execute a node on its own task, racing it against cancellation and the
/// run deadline. An interrupted task is left to finish on its own; its result
/// is dropped.
pub async fn execute_detached(
    job: NodeJob,
    cancel: Option<CancelHandle>,
    deadline: Option<Instant>,
) -> std::result::Result<HarnessResult, Interrupted> {
    let node_id = job.node_id.clone();
    let node_name = job.node_name.clone();
    let mut handle = tokio::spawn(execute(job));

    tokio::select! {
        biased;
        joined = &mut handle => match joined {
            Ok(result) => Ok(result),
            Err(join_err) => {
                let cause = Error::Execution(if join_err.is_panic() {
                    "node task panicked".to_string()
                } else {
                    format!("node task failed: {}", join_err)
                });
                Ok(Err(NodeExecutionError::new(&node_id, &node_name, &cause)))
            }
        },
        _ = wait_cancelled(cancel) => {
            warn!("Run cancelled while node '{}' was executing; discarding its result", node_name);
            Err(Interrupted::Cancelled)
        }
        _ = wait_deadline(deadline) => {
            warn!("Run deadline passed while node '{}' was executing", node_name);
            Err(Interrupted::DeadlineExceeded)
        }
    }
}

async fn wait_cancelled(cancel: Option<CancelHandle>) {
    match cancel {
        Some(handle) => handle.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn execute_per_item(job: &NodeJob) -> HarnessResult {
    let outputs = job.descriptor.outputs();
    let input: &[crate::nodes::DataItem] = job.inputs.first().map(|v| v.as_slice()).unwrap_or(&[]);

    let templated = contains_expression(&job.params);
    let mut branches: Vec<ItemList> = vec![Vec::new(); outputs];
    let mut item_errors = Vec::new();
    let mut attempts_used = 1u32;

    for (index, item) in input.iter().enumerate() {
        let scope = ExpressionScope::new(&job.snapshot, input).for_item(index, item);
        let resolved = if templated {
            resolve_params(&job.params, &scope)
        } else {
            Ok(job.params.clone())
        };
        let params = match resolved {
            Ok(params) => params,
            Err(expr_err) => {
                let err: Error = expr_err.into();
                if job.abort_on_expression_error {
                    return Err(job.failure(&err).with_item(index));
                }
                warn!(
                    "Node '{}' item {}: parameter resolution failed, skipping item: {}",
                    job.node_name, index, err
                );
                item_errors.push(ItemError::new(index, &err));
                continue;
            }
        };

        let ctx = job.context.for_item(index);
        let attempted = run_with_retry(job, || job.node.execute_item(&params, item, &ctx)).await;

        match attempted {
            Attempted::Done { value, attempts } => {
                attempts_used = attempts_used.max(attempts);
                for (branch, produced) in value.emits {
                    if branch >= outputs {
                        let err = Error::Execution(format!(
                            "emitted on branch {} but declares {} output(s)",
                            branch, outputs
                        ));
                        return Err(job.failure(&err).with_item(index).with_attempts(attempts));
                    }
                    branches[branch].push(produced);
                }
            }
            Attempted::Failed {
                error,
                attempts,
                decision,
            } => {
                attempts_used = attempts_used.max(attempts);
                match decision {
                    FailureDecision::SkipItem => {
                        warn!(
                            "Node '{}' item {} failed after {} attempt(s), continuing: {}",
                            job.node_name, index, attempts, error
                        );
                        item_errors.push(ItemError::new(index, &error));
                    }
                    FailureDecision::ContinueWithEmpty => {
                        let failure = job.failure(&error).with_item(index).with_attempts(attempts);
                        return Ok(job.empty_output(failure, attempts_used));
                    }
                    FailureDecision::Propagate | FailureDecision::Retry(_) => {
                        return Err(job.failure(&error).with_item(index).with_attempts(attempts));
                    }
                }
            }
        }
    }

    if !item_errors.is_empty() {
        metrics::record_item_errors(&job.node_type, item_errors.len());
    }

    Ok(NodeSuccess {
        output: NodeOutput::from_branches(branches),
        item_errors,
        attempts: attempts_used,
        recovered: None,
    })
}

async fn execute_batch(job: &NodeJob) -> HarnessResult {
    let outputs = job.descriptor.outputs();
    let input: &[crate::nodes::DataItem] = job.inputs.first().map(|v| v.as_slice()).unwrap_or(&[]);

    let mut scope = ExpressionScope::new(&job.snapshot, input);
    if let Some(first) = input.first() {
        scope = scope.for_item(0, first);
    }
    let resolved = if contains_expression(&job.params) {
        resolve_params(&job.params, &scope)
    } else {
        Ok(job.params.clone())
    };
    let params = match resolved {
        Ok(params) => params,
        Err(expr_err) => {
            let err: Error = expr_err.into();
            return match job.policy.decide(1, &err, None) {
                FailureDecision::ContinueWithEmpty | FailureDecision::SkipItem
                    if !job.abort_on_expression_error =>
                {
                    Ok(job.empty_output(job.failure(&err), 1))
                }
                _ => Err(job.failure(&err)),
            };
        }
    };

    let attempted = run_with_retry(job, || {
        job.node.execute_batch(&params, &job.inputs, &job.context)
    })
    .await;

    match attempted {
        Attempted::Done {
            value: mut output,
            attempts,
        } => {
            if output.branches.len() > outputs {
                let err = Error::Execution(format!(
                    "returned {} branches but declares {} output(s)",
                    output.branches.len(),
                    outputs
                ));
                return Err(job.failure(&err).with_attempts(attempts));
            }
            output.branches.resize(outputs, Some(Vec::new()));
            Ok(NodeSuccess {
                output,
                item_errors: Vec::new(),
                attempts,
                recovered: None,
            })
        }
        Attempted::Failed {
            error,
            attempts,
            decision,
        } => match decision {
            // Batch nodes have no items to isolate.
            FailureDecision::ContinueWithEmpty | FailureDecision::SkipItem => {
                Ok(job.empty_output(job.failure(&error).with_attempts(attempts), attempts))
            }
            FailureDecision::Propagate | FailureDecision::Retry(_) => {
                Err(job.failure(&error).with_attempts(attempts))
            }
        },
    }
}

/// Call `invoke` until it succeeds or the policy gives up.
async fn run_with_retry<T, F, Fut>(job: &NodeJob, mut invoke: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = job.policy.max_attempts();
    let mut attempt = 1u32;

    loop {
        let result = match timeout(job.timeout, invoke()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Execution(format!(
                "Node '{}' timed out after {}ms",
                job.node_name,
                job.timeout.as_millis()
            ))),
        };

        let error = match result {
            Ok(value) => {
                return Attempted::Done {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => error,
        };

        match job.policy.decide(attempt, &error, job.remaining()) {
            FailureDecision::Retry(delay) => {
                warn!(
                    "Node '{}' attempt {}/{} failed: {}. Retrying in {}ms",
                    job.node_name,
                    attempt,
                    max_attempts,
                    error,
                    delay.as_millis()
                );
                metrics::record_node_retry(&job.node_type);
                sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            decision => {
                debug!(
                    "Node '{}' giving up after {} attempt(s): {:?}",
                    job.node_name, attempt, decision
                );
                return Attempted::Failed {
                    error,
                    attempts: attempt,
                    decision,
                };
            }
        }
    }
}

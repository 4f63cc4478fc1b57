//! Workflow graph walker.
//!
//! Drives one run from its start nodes to a terminal (or waiting) state:
//! dequeues ready nodes, hands them to the harness, records results and
//! routes each activated branch to its targets. The walker is the only
//! writer of [`RunState`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::cancel::{CancelHandle, CancelRegistry};
use super::context::{
    ExecutionResult, ResultStatus, RunFailure, RunMode, RunSnapshot, RunState, RunStatus,
    WaitingRecord,
};
use super::harness::{execute_detached, HarnessResult, Interrupted, NodeJob};
use super::policy::{remaining_until, ErrorPolicy};
use super::router::RoutingTable;
use crate::config::EngineConfig;
use crate::error::{Error, NodeExecutionError, Result};
use crate::metrics;
use crate::nodes::{
    items_from_json, DataItem, InputPolicy, ItemList, Node, NodeContext, NodeDescriptor,
    NodeOutput, NodeRegistry,
};
use crate::storage::ExecutionSink;
use crate::workflow::{
    check_required_inputs_reachable, reachable_from, validate_graph, ConnectionKind,
    Node as WorkflowNode, Workflow,
};

/// Connection key used for items that did not arrive over a connection:
/// trigger items, and inputs retained for a node that has to run again.
/// Input `i` is stored under `RETAINED_INPUT - i`.
const RETAINED_INPUT: usize = usize::MAX;

/// Source of workflows for error-workflow dispatch.
#[async_trait]
pub trait WorkflowCatalog: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<Arc<Workflow>>>;
}

/// Catalog backed by a map.
#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow: Workflow) -> Self {
        self.insert(workflow);
        self
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows
            .insert(workflow.id.clone(), Arc::new(workflow));
    }
}

#[async_trait]
impl WorkflowCatalog for InMemoryCatalog {
    async fn get_workflow(&self, id: &str) -> Result<Option<Arc<Workflow>>> {
        Ok(self.workflows.get(id).cloned())
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow: Arc<Workflow>,
    /// Items every default start node receives
    pub trigger_items: ItemList,
    /// Explicit start bindings; when empty, every node without incoming
    /// main connections receives `trigger_items`
    pub start: Vec<(String, ItemList)>,
    pub mode: RunMode,
    pub run_id: Option<String>,
}

impl RunRequest {
    /// A manual run with a single empty trigger item.
    pub fn new(workflow: impl Into<Arc<Workflow>>) -> Self {
        Self {
            workflow: workflow.into(),
            trigger_items: vec![DataItem::empty()],
            start: Vec::new(),
            mode: RunMode::Manual,
            run_id: None,
        }
    }

    pub fn with_items(mut self, items: ItemList) -> Self {
        self.trigger_items = items;
        self
    }

    /// Bind items to a specific start node.
    pub fn with_start(mut self, node_id: &str, items: ItemList) -> Self {
        self.start.push((node_id.to_string(), items));
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Start bindings in node declaration order.
    fn bindings(&self) -> Vec<(String, ItemList)> {
        let mut bindings: Vec<(String, ItemList)> = if self.start.is_empty() {
            self.workflow
                .entry_nodes()
                .into_iter()
                .map(|id| (id.to_string(), self.trigger_items.clone()))
                .collect()
        } else {
            self.start.clone()
        };
        bindings.sort_by_key(|(id, _)| self.workflow.node_position(id).unwrap_or(usize::MAX));
        bindings
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// The error workflow's run, when one was dispatched
    pub error_workflow_run: Option<RunState>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        self.state.status
    }

    pub fn is_success(&self) -> bool {
        self.state.status == RunStatus::Success
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.state.failure.as_ref()
    }

    /// Serialized state of a waiting run.
    pub fn resume_token(&self) -> Option<Result<String>> {
        (self.state.status == RunStatus::Waiting).then(|| self.state.to_resume_token())
    }
}

/// Workflow graph walker.
#[derive(Clone)]
pub struct Walker {
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
    sink: Option<Arc<dyn ExecutionSink>>,
    catalog: Option<Arc<dyn WorkflowCatalog>>,
    cancel_registry: CancelRegistry,
}

impl Default for Walker {
    fn default() -> Self {
        Self::new(NodeRegistry::new())
    }
}

impl Walker {
    /// Create a walker over the given node types.
    pub fn new(registry: NodeRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: EngineConfig::default(),
            sink: None,
            catalog: None,
            cancel_registry: CancelRegistry::new(),
        }
    }

    /// Report progress and persist state to a sink.
    pub fn with_sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resolve error workflows through a catalog.
    pub fn with_catalog(mut self, catalog: Arc<dyn WorkflowCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Share a cancel registry (e.g. with a server that cancels runs).
    pub fn with_cancel_registry(mut self, registry: CancelRegistry) -> Self {
        self.cancel_registry = registry;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn cancel_registry(&self) -> &CancelRegistry {
        &self.cancel_registry
    }

    /// Request cancellation of an in-flight run.
    pub async fn cancel(&self, run_id: &str) -> bool {
        self.cancel_registry.cancel(run_id).await
    }

    /// Execute a workflow.
    ///
    /// Graph integrity failures are returned as `Err` before any node runs.
    /// Everything that happens once nodes execute (node failures, timeout,
    /// cancellation) ends up in the report's state instead.
    #[instrument(
        name = "workflow.run",
        skip(self, request),
        fields(
            workflow_id = %request.workflow.id,
            mode = %request.mode,
        )
    )]
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        let workflow = request.workflow.clone();
        validate_graph(&workflow, &self.registry)?;

        let bindings = request.bindings();
        let start_nodes: Vec<String> = bindings.iter().map(|(id, _)| id.clone()).collect();
        let reachable = check_required_inputs_reachable(&workflow, &self.registry, &start_nodes)?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut state = RunState::new(&run_id, &workflow, request.mode);
        state.start_nodes = start_nodes;
        for (node_id, items) in bindings {
            state.deliver(&node_id, RETAINED_INPUT, 0, items);
            state.enqueue(&node_id);
        }

        info!(
            "Starting run {} of workflow '{}' ({} start node(s))",
            run_id,
            workflow.id,
            state.start_nodes.len()
        );
        self.drive(workflow, reachable, state, None).await
    }

    /// Continue a waiting run. The waiting node completes with
    /// `resume_items` on branch 0, or with the output it produced before
    /// suspending when none are given.
    #[instrument(name = "workflow.resume", skip(self, workflow, state, resume_items), fields(run_id = %state.run_id))]
    pub async fn resume(
        &self,
        workflow: Arc<Workflow>,
        mut state: RunState,
        resume_items: Option<ItemList>,
    ) -> Result<RunReport> {
        if state.workflow_id != workflow.id {
            return Err(Error::Execution(format!(
                "Run {} belongs to workflow '{}', not '{}'",
                state.run_id, state.workflow_id, workflow.id
            )));
        }
        if state.status != RunStatus::Waiting {
            return Err(Error::Execution(format!(
                "Run {} is {}, not waiting",
                state.run_id, state.status
            )));
        }
        let Some(waiting) = state.waiting.take() else {
            return Err(Error::Execution(format!(
                "Run {} has no waiting node",
                state.run_id
            )));
        };

        validate_graph(&workflow, &self.registry)?;
        let reachable = reachable_from(&workflow, &state.start_nodes);
        state.status = RunStatus::Running;

        let branches = match resume_items {
            Some(items) => {
                let mut branches = vec![Some(items)];
                branches.resize(waiting.branches.len().max(1), Some(Vec::new()));
                branches
            }
            None => waiting.branches.clone(),
        };
        info!(
            "Resuming run {} at node '{}' (waiting since {})",
            state.run_id, waiting.node_name, waiting.since
        );

        let completion = Completion {
            header: Header {
                node_id: waiting.node_id.clone(),
                node_name: waiting.node_name.clone(),
                node_type: workflow
                    .get_node(&waiting.node_id)
                    .map(|n| n.node_type.clone())
                    .unwrap_or_default(),
                run_index: waiting.run_index,
                inputs: Vec::new(),
                started_at: waiting.since,
                started: Instant::now(),
            },
            outcome: Outcome::Bypassed {
                output: NodeOutput {
                    branches,
                    ..NodeOutput::default()
                },
                status: ResultStatus::Success,
            },
        };
        self.drive(workflow, reachable, state, Some(completion)).await
    }

    /// Load a waiting run from the sink and resume it.
    pub async fn resume_from_sink(
        &self,
        workflow: Arc<Workflow>,
        run_id: &str,
        resume_items: Option<ItemList>,
    ) -> Result<RunReport> {
        let Some(sink) = &self.sink else {
            return Err(Error::Config("No execution sink configured".to_string()));
        };
        let state = sink
            .load_state(run_id)
            .await?
            .ok_or_else(|| Error::Execution(format!("Run {} not found", run_id)))?;
        self.resume(workflow, state, resume_items).await
    }

    /// Start a new run that continues where a failed (or cancelled) run
    /// stopped: successful results are kept and the failed node runs again
    /// with the inputs it had.
    #[instrument(name = "workflow.retry", skip(self, workflow, previous), fields(previous_run_id = %previous.run_id))]
    pub async fn retry_run(&self, workflow: Arc<Workflow>, previous: &RunState) -> Result<RunReport> {
        if previous.workflow_id != workflow.id {
            return Err(Error::Execution(format!(
                "Run {} belongs to workflow '{}', not '{}'",
                previous.run_id, previous.workflow_id, workflow.id
            )));
        }
        if !matches!(previous.status, RunStatus::Error | RunStatus::Cancelled) {
            return Err(Error::Execution(format!(
                "Run {} is {}; only failed or cancelled runs can be retried",
                previous.run_id, previous.status
            )));
        }

        validate_graph(&workflow, &self.registry)?;
        let reachable = reachable_from(&workflow, &previous.start_nodes);

        let mut state = previous.clone();
        state.run_id = uuid::Uuid::new_v4().to_string();
        state.mode = RunMode::Retry;
        state.status = RunStatus::Running;
        state.started_at = Utc::now();
        state.finished_at = None;
        state.waiting = None;
        state.results.retain(|r| r.status != ResultStatus::Error);
        state
            .metadata
            .insert("retry_of".to_string(), json!(previous.run_id));

        if let Some(failed) = previous.failure.as_ref().and_then(|f| f.node_id.clone()) {
            state.executed.remove(&failed);
            // The discarded error result must not consume a run index
            let last_kept = state.results_for(&failed).iter().map(|r| r.run_index).max();
            match last_kept {
                Some(last) => state.run_counts.insert(failed.clone(), last + 1),
                None => state.run_counts.remove(&failed),
            };
            state.ready.retain(|n| n != &failed);
            state.ready.push_front(failed);
        }
        state.failure = None;

        info!(
            "Retrying run {} as {} ({} result(s) kept)",
            previous.run_id,
            state.run_id,
            state.results.len()
        );
        self.drive(workflow, reachable, state, None).await
    }

    async fn drive(
        &self,
        workflow: Arc<Workflow>,
        reachable: HashSet<String>,
        mut state: RunState,
        initial: Option<Completion>,
    ) -> Result<RunReport> {
        let cancel = self.cancel_registry.register(&state.run_id).await;
        let session = match Session::new(&self.registry, &self.config, workflow, reachable, cancel) {
            Ok(session) => session,
            Err(e) => {
                self.cancel_registry.unregister(&state.run_id).await;
                return Err(e);
            }
        };

        metrics::inc_active_runs();
        let started = Instant::now();
        self.sink_run_started(&state).await;

        let mut stop = None;
        if let Some(completion) = initial {
            stop = self.apply(&session, &mut state, completion).await.into_stop();
        }
        let stop = match stop {
            Some(stop) => stop,
            None => self.walk(&session, &mut state).await,
        };

        Ok(self.finish(&session, state, stop, started).await)
    }

    /// The ready-queue loop.
    async fn walk(&self, session: &Session, state: &mut RunState) -> Stop {
        loop {
            if let Some(stop) = session.checkpoint() {
                return stop;
            }

            let wave: Vec<String> = if session.parallel {
                state.ready.drain(..).collect()
            } else {
                state.take_ready().into_iter().collect()
            };
            if wave.is_empty() {
                return Stop::Drained;
            }

            let snapshot = state.snapshot(&session.workflow);
            let prepared: Vec<Prepared> = wave
                .iter()
                .filter_map(|node_id| self.prepare(session, state, node_id, &snapshot))
                .collect();
            let completions = self.execute_wave(session, prepared).await;

            let mut remaining = completions.into_iter();
            while let Some(completion) = remaining.next() {
                if let Outcome::Interrupted(reason) = completion.outcome {
                    let mut unapplied = vec![completion.header];
                    unapplied.extend(remaining.by_ref().map(|c| c.header));
                    requeue(state, unapplied);
                    return match reason {
                        Interrupted::Cancelled => Stop::Cancelled,
                        Interrupted::DeadlineExceeded => Stop::TimedOut,
                    };
                }

                if let Some(stop) = self.apply(session, state, completion).await.into_stop() {
                    let unapplied: Vec<Header> = remaining.by_ref().map(|c| c.header).collect();
                    if !unapplied.is_empty() {
                        debug!(
                            "Re-queueing {} node(s) whose results were not applied",
                            unapplied.len()
                        );
                    }
                    requeue(state, unapplied);
                    return stop;
                }
            }
        }
    }

    /// Take a node's inputs and build what will run for it.
    fn prepare(
        &self,
        session: &Session,
        state: &mut RunState,
        node_id: &str,
        snapshot: &Arc<RunSnapshot>,
    ) -> Option<Prepared> {
        let Some(entry) = session.entries.get(node_id) else {
            warn!("Dequeued unknown node '{}', skipping", node_id);
            return None;
        };
        let def = session.definition(entry);

        let inputs = state.take_inputs(node_id, entry.descriptor.inputs);
        let run_index = state.next_run_index(node_id);
        let header = Header {
            node_id: def.id.clone(),
            node_name: def.display_name().to_string(),
            node_type: def.node_type.clone(),
            run_index,
            inputs,
            started_at: Utc::now(),
            started: Instant::now(),
        };
        let outputs = entry.descriptor.outputs();

        if def.disabled {
            debug!("Node '{}' is disabled, passing input through", header.node_name);
            let output = NodeOutput::empty(outputs).with_branch(0, header.inputs[0].clone());
            return Some(Prepared {
                header,
                work: Work::Bypass(output, ResultStatus::Skipped),
            });
        }

        if let Some(pinned) = &def.pinned_data {
            debug!("Node '{}' has pinned data, not executing", header.node_name);
            let output =
                NodeOutput::empty(outputs).with_branch(0, items_from_json(pinned.iter().cloned()));
            return Some(Prepared {
                header,
                work: Work::Bypass(output, ResultStatus::Success),
            });
        }

        let mut policy = ErrorPolicy::for_node(def);
        if let Some(retry) = policy.retry.as_mut() {
            if retry.max_delay_ms.is_none() {
                retry.max_delay_ms = Some(self.config.max_retry_delay_ms);
            }
        }

        let job = NodeJob {
            node: entry.node.clone(),
            node_id: header.node_id.clone(),
            node_name: header.node_name.clone(),
            node_type: header.node_type.clone(),
            params: def.parameters.clone(),
            descriptor: entry.descriptor.clone(),
            inputs: header.inputs.clone(),
            snapshot: snapshot.clone(),
            context: NodeContext::new(&state.run_id, node_id)
                .with_workflow(&state.workflow_id)
                .with_node_name(&header.node_name)
                .with_run_index(run_index)
                .with_state(state.node_state.get(node_id).cloned()),
            policy,
            timeout: def
                .timeout_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or_else(|| self.config.node_timeout()),
            abort_on_expression_error: def.abort_on_expression_error,
            deadline: session.deadline,
        };

        Some(Prepared {
            header,
            work: Work::Job(job),
        })
    }

    /// Run a wave of prepared nodes, at most `max_concurrency` at a time.
    /// Completions come back in the order the nodes were dequeued.
    async fn execute_wave(&self, session: &Session, wave: Vec<Prepared>) -> Vec<Completion> {
        let mut headers = Vec::with_capacity(wave.len());
        let mut outcomes: Vec<Option<Outcome>> = Vec::with_capacity(wave.len());
        let mut jobs: VecDeque<(usize, NodeJob)> = VecDeque::new();

        for (idx, prepared) in wave.into_iter().enumerate() {
            headers.push(prepared.header);
            match prepared.work {
                Work::Bypass(output, status) => outcomes.push(Some(Outcome::Bypassed { output, status })),
                Work::Job(job) => {
                    outcomes.push(None);
                    jobs.push_back((idx, job));
                }
            }
        }

        let mut join_set: JoinSet<(usize, std::result::Result<HarnessResult, Interrupted>)> =
            JoinSet::new();
        loop {
            while join_set.len() < session.max_concurrency {
                let Some((idx, job)) = jobs.pop_front() else {
                    break;
                };
                let cancel = session.cancel.clone();
                let deadline = session.deadline;
                join_set.spawn(async move { (idx, execute_detached(job, Some(cancel), deadline).await) });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((idx, Ok(result))) => outcomes[idx] = Some(Outcome::Ran(result)),
                Ok((idx, Err(reason))) => outcomes[idx] = Some(Outcome::Interrupted(reason)),
                Err(e) => error!("Node worker task join failed: {}", e),
            }
        }

        headers
            .into_iter()
            .zip(outcomes)
            .map(|(header, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    let cause = Error::Execution("node worker task was lost".to_string());
                    Outcome::Ran(Err(NodeExecutionError::new(
                        &header.node_id,
                        &header.node_name,
                        &cause,
                    )))
                });
                Completion { header, outcome }
            })
            .collect()
    }

    /// Fold one completion into the run state.
    async fn apply(&self, session: &Session, state: &mut RunState, completion: Completion) -> Flow {
        let Completion { header, outcome } = completion;

        let (output, item_errors, attempts, recovered, status) = match outcome {
            Outcome::Ran(Ok(success)) => (
                success.output,
                success.item_errors,
                success.attempts,
                success.recovered,
                ResultStatus::Success,
            ),
            Outcome::Bypassed { output, status } => (output, Vec::new(), 0, None, status),
            Outcome::Ran(Err(err)) => {
                self.record_failure(state, &header, err.clone()).await;
                retain_inputs(state, &header.node_id, header.inputs);
                return Flow::Failed(err);
            }
            Outcome::Interrupted(_) => return Flow::Continue,
        };

        let NodeOutput {
            branches,
            state: state_change,
            suspend,
        } = output;
        state.apply_state(&header.node_id, state_change);
        state.mark_executed(&header.node_id);

        if let Some(suspend) = suspend {
            info!(
                "Run {} waiting on node '{}': {}",
                state.run_id, header.node_name, suspend.reason
            );
            state.waiting = Some(WaitingRecord {
                node_id: header.node_id,
                node_name: header.node_name,
                run_index: header.run_index,
                reason: suspend.reason,
                resume_at: suspend.resume_at,
                branches,
                since: Utc::now(),
            });
            return Flow::Suspended;
        }

        let result = ExecutionResult {
            node_id: header.node_id.clone(),
            node_name: header.node_name.clone(),
            run_index: header.run_index,
            status,
            branches: branches.clone(),
            item_errors,
            error: recovered,
            attempts,
            started_at: header.started_at,
            finished_at: Utc::now(),
            duration_ms: header.started.elapsed().as_millis() as u64,
        };
        debug!(
            "Node '{}' finished: {} item(s) out, {} item error(s)",
            header.node_name,
            branches.iter().flatten().map(|b| b.len()).sum::<usize>(),
            result.item_errors.len()
        );
        self.record(state, &header, result).await;

        match self.route(session, state, &header.node_id, &branches) {
            Ok(()) => Flow::Continue,
            Err((target, err)) => {
                let target_header = Header {
                    node_id: target.clone(),
                    node_name: err.node_name.clone(),
                    node_type: session
                        .entries
                        .get(&target)
                        .map(|e| session.definition(e).node_type.clone())
                        .unwrap_or_default(),
                    run_index: state.next_run_index(&target),
                    inputs: Vec::new(),
                    started_at: Utc::now(),
                    started: Instant::now(),
                };
                self.record_failure(state, &target_header, err.clone()).await;
                Flow::Failed(err)
            }
        }
    }

    /// Deliver each activated branch to its targets, enqueueing those that
    /// become ready. Fails with the loop target when a loop runs too often.
    fn route(
        &self,
        session: &Session,
        state: &mut RunState,
        source: &str,
        branches: &[Option<ItemList>],
    ) -> std::result::Result<(), (String, NodeExecutionError)> {
        for (branch, items) in branches.iter().enumerate() {
            let Some(items) = items else {
                continue;
            };
            for route in session.routes.routes(source, branch) {
                match route.kind {
                    ConnectionKind::Main => {
                        if !state.deliver(&route.to, route.connection_index, route.input, items.clone())
                        {
                            warn!(
                                "Node '{}' already ran; delivery from '{}' (connection {}) recorded as late",
                                route.to, source, route.connection_index
                            );
                            continue;
                        }
                        if session.is_ready(state, &route.to) {
                            state.enqueue(&route.to);
                        }
                    }
                    ConnectionKind::Loop => {
                        let visits = state.count_loop_visit(&route.to);
                        if visits > session.max_loop_iterations {
                            let name = session
                                .workflow
                                .get_node(&route.to)
                                .map(|n| n.display_name().to_string())
                                .unwrap_or_else(|| route.to.clone());
                            let cause = Error::Execution(format!(
                                "Loop limit of {} iterations exceeded",
                                session.max_loop_iterations
                            ));
                            return Err((
                                route.to.clone(),
                                NodeExecutionError::new(&route.to, &name, &cause),
                            ));
                        }
                        debug!("Loop back into '{}' (visit {})", route.to, visits);
                        state.rearm(session.routes.loop_body(&route.to).iter().map(String::as_str));
                        state.deliver(&route.to, route.connection_index, route.input, items.clone());
                        state.enqueue(&route.to);
                    }
                }
            }
        }
        Ok(())
    }

    async fn record(&self, state: &mut RunState, header: &Header, result: ExecutionResult) {
        metrics::record_node_execution(&header.node_type, result.status.as_str());
        metrics::record_node_duration(header.started.elapsed(), &header.node_type);
        self.sink_record(&state.run_id, &result).await;
        state.record_result(result);
    }

    async fn record_failure(&self, state: &mut RunState, header: &Header, err: NodeExecutionError) {
        error!("{}", err);
        let result = ExecutionResult {
            node_id: header.node_id.clone(),
            node_name: header.node_name.clone(),
            run_index: header.run_index,
            status: ResultStatus::Error,
            branches: Vec::new(),
            item_errors: Vec::new(),
            attempts: err.attempts,
            error: Some(err.clone()),
            started_at: header.started_at,
            finished_at: Utc::now(),
            duration_ms: header.started.elapsed().as_millis() as u64,
        };
        self.record(state, header, result).await;
        state.failure = Some(RunFailure::from_node_error(&err));
    }

    async fn finish(
        &self,
        session: &Session,
        mut state: RunState,
        stop: Stop,
        started: Instant,
    ) -> RunReport {
        match stop {
            Stop::Drained => {
                for (node_id, pending) in &state.pending {
                    if !pending.is_empty() && !state.executed.contains(node_id) {
                        warn!(
                            "Node '{}' received {} delivery(ies) but never became ready",
                            node_id,
                            pending.len()
                        );
                    }
                }
                state.status = RunStatus::Success;
                info!(
                    "Run {} completed successfully ({} node execution(s))",
                    state.run_id,
                    state.results.len()
                );
            }
            Stop::Suspended => {
                state.status = RunStatus::Waiting;
            }
            Stop::Failed(err) => {
                state.status = RunStatus::Error;
                state.failure = Some(RunFailure::from_node_error(&err));
                error!("Run {} failed: {}", state.run_id, err);
            }
            Stop::Cancelled => {
                state.status = RunStatus::Cancelled;
                state.failure = Some(RunFailure::from_error(&Error::Cancelled(format!(
                    "run {} was cancelled",
                    state.run_id
                ))));
                warn!("Run {} cancelled", state.run_id);
            }
            Stop::TimedOut => {
                let err = Error::RunTimeout {
                    timeout_ms: session.timeout_ms,
                };
                state.status = RunStatus::Error;
                state.failure = Some(RunFailure::from_error(&err));
                error!("Run {} failed: {}", state.run_id, err);
            }
        }

        if state.status != RunStatus::Waiting {
            state.finished_at = Some(Utc::now());
        }
        self.sink_save(&state).await;
        self.cancel_registry.unregister(&state.run_id).await;

        metrics::dec_active_runs();
        metrics::record_run(state.status.as_str(), state.mode.as_str());
        metrics::record_run_duration(started.elapsed(), &state.workflow_id);

        let error_workflow_run = if state.status == RunStatus::Error {
            self.dispatch_error_workflow(&session.workflow, &state).await
        } else {
            None
        };

        RunReport {
            state,
            error_workflow_run,
        }
    }

    /// Start the configured error workflow as a new, independent run.
    async fn dispatch_error_workflow(
        &self,
        workflow: &Workflow,
        state: &RunState,
    ) -> Option<RunState> {
        let target = workflow.settings.error_workflow.as_deref()?;
        if state.mode == RunMode::ErrorHandler {
            debug!(
                "Run {} is an error handler itself; not dispatching '{}'",
                state.run_id, target
            );
            return None;
        }
        let Some(catalog) = &self.catalog else {
            warn!(
                "Error workflow '{}' configured but no workflow catalog is available",
                target
            );
            return None;
        };

        let error_workflow = match catalog.get_workflow(target).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                warn!("Error workflow '{}' not found, skipping", target);
                metrics::record_error_workflow("not_found");
                return None;
            }
            Err(e) => {
                error!("Failed to load error workflow '{}': {}", target, e);
                metrics::record_error_workflow("load_failed");
                return None;
            }
        };

        info!(
            "Triggering error workflow '{}' for failed run '{}'",
            target, state.run_id
        );
        let request = RunRequest::new(error_workflow)
            .with_items(items_from_json([error_payload(workflow, state)]))
            .with_mode(RunMode::ErrorHandler);

        match self.run_boxed(request).await {
            Ok(report) => {
                info!(
                    "Error workflow '{}' finished with status: {}",
                    target,
                    report.status()
                );
                metrics::record_error_workflow(report.status().as_str());
                Some(report.state)
            }
            Err(e) => {
                error!("Error workflow '{}' could not start: {}", target, e);
                metrics::record_error_workflow("rejected");
                None
            }
        }
    }

    /// `run` behind a box, so the error-workflow dispatch can recurse.
    fn run_boxed(&self, request: RunRequest) -> Pin<Box<dyn Future<Output = Result<RunReport>> + Send + '_>> {
        Box::pin(async move { self.run(request).await })
    }

    async fn sink_run_started(&self, state: &RunState) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.run_started(state).await {
                warn!("Failed to record start of run {}: {}", state.run_id, e);
            }
        }
    }

    async fn sink_record(&self, run_id: &str, result: &ExecutionResult) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_result(run_id, result).await {
                warn!(
                    "Failed to record result of node '{}' for run {}: {}",
                    result.node_id, run_id, e
                );
            }
        }
    }

    async fn sink_save(&self, state: &RunState) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.save_state(state).await {
                warn!("Failed to save state of run {}: {}", state.run_id, e);
            }
        }
    }
}

/// Trigger payload handed to an error workflow.
pub fn error_payload(workflow: &Workflow, state: &RunState) -> Value {
    let failure = state.failure.as_ref();
    let name_of = |id: &str| {
        workflow
            .get_node(id)
            .map(|n| n.display_name().to_string())
            .unwrap_or_else(|| id.to_string())
    };

    json!({
        "execution": {
            "id": state.run_id,
            "mode": state.mode.as_str(),
            "error": {
                "message": failure.map(|f| f.message.clone()),
                "node": failure.and_then(|f| f.node_name.clone()),
                "node_id": failure.and_then(|f| f.node_id.clone()),
                "item_index": failure.and_then(|f| f.item_index),
                "code": failure.map(|f| f.code.clone()),
            },
            "last_node_executed": state.results.last().map(|r| r.node_name.clone()),
            "completed_nodes": state
                .completed_nodes()
                .iter()
                .map(|id| name_of(id))
                .collect::<Vec<_>>(),
        },
        "workflow": {
            "id": workflow.id,
            "name": workflow.name,
        },
    })
}

/// Put nodes back at the front of the ready queue, in order, with their
/// inputs, so a resumed or retried run executes them again.
fn requeue(state: &mut RunState, headers: Vec<Header>) {
    for header in headers.into_iter().rev() {
        retain_inputs(state, &header.node_id, header.inputs);
        state.ready.retain(|n| n != &header.node_id);
        state.ready.push_front(header.node_id);
    }
}

fn retain_inputs(state: &mut RunState, node_id: &str, inputs: Vec<ItemList>) {
    for (input, items) in inputs.into_iter().enumerate() {
        state.deliver(node_id, RETAINED_INPUT - input, input, items);
    }
}

/// Per-run facts that do not change while the run executes.
struct Session {
    workflow: Arc<Workflow>,
    routes: RoutingTable,
    reachable: HashSet<String>,
    entries: HashMap<String, NodeEntry>,
    cancel: CancelHandle,
    deadline: Option<Instant>,
    timeout_ms: u64,
    parallel: bool,
    max_concurrency: usize,
    max_loop_iterations: u32,
}

struct NodeEntry {
    /// Position in the workflow's node list
    index: usize,
    node: Arc<dyn Node>,
    descriptor: NodeDescriptor,
}

impl Session {
    fn new(
        registry: &NodeRegistry,
        config: &EngineConfig,
        workflow: Arc<Workflow>,
        reachable: HashSet<String>,
        cancel: CancelHandle,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        for (index, def) in workflow.nodes.iter().enumerate() {
            let node = registry.require(&def.node_type)?;
            let descriptor = node.descriptor(&def.parameters);
            entries.insert(
                def.id.clone(),
                NodeEntry {
                    index,
                    node,
                    descriptor,
                },
            );
        }

        let timeout_ms = if workflow.settings.timeout_ms > 0 {
            workflow.settings.timeout_ms
        } else {
            config.run_timeout_ms
        };
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        Ok(Self {
            routes: RoutingTable::new(&workflow),
            reachable,
            entries,
            cancel,
            deadline,
            timeout_ms,
            parallel: workflow.settings.parallel_branches,
            max_concurrency: workflow
                .settings
                .max_concurrency
                .min(config.max_concurrency)
                .max(1),
            max_loop_iterations: workflow
                .settings
                .max_loop_iterations
                .min(config.max_loop_iterations),
            workflow,
        })
    }

    fn definition(&self, entry: &NodeEntry) -> &WorkflowNode {
        &self.workflow.nodes[entry.index]
    }

    fn checkpoint(&self) -> Option<Stop> {
        if self.cancel.is_cancelled() {
            return Some(Stop::Cancelled);
        }
        match self.deadline {
            Some(deadline) if remaining_until(deadline).is_none() => Some(Stop::TimedOut),
            _ => None,
        }
    }

    fn is_ready(&self, state: &RunState, node_id: &str) -> bool {
        let Some(entry) = self.entries.get(node_id) else {
            return false;
        };
        match entry.descriptor.input_policy {
            InputPolicy::WaitForAll => {
                let required = self.routes.required_connections(node_id, &self.reachable);
                state.is_ready(node_id, true, &required)
            }
            InputPolicy::Any => state.is_ready(node_id, false, &[]),
        }
    }
}

/// A dequeued node and what it consumed.
struct Header {
    node_id: String,
    node_name: String,
    node_type: String,
    run_index: u32,
    inputs: Vec<ItemList>,
    started_at: DateTime<Utc>,
    started: Instant,
}

struct Prepared {
    header: Header,
    work: Work,
}

enum Work {
    /// Disabled or pinned: output is known without running the node
    Bypass(NodeOutput, ResultStatus),
    Job(NodeJob),
}

struct Completion {
    header: Header,
    outcome: Outcome,
}

enum Outcome {
    Ran(HarnessResult),
    Bypassed {
        output: NodeOutput,
        status: ResultStatus,
    },
    Interrupted(Interrupted),
}

enum Flow {
    Continue,
    Suspended,
    Failed(NodeExecutionError),
}

impl Flow {
    fn into_stop(self) -> Option<Stop> {
        match self {
            Flow::Continue => None,
            Flow::Suspended => Some(Stop::Suspended),
            Flow::Failed(err) => Some(Stop::Failed(err)),
        }
    }
}

enum Stop {
    Drained,
    Suspended,
    Failed(NodeExecutionError),
    Cancelled,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::ItemOutput;
    use crate::storage::{RunQuery, SqliteSink};
    use crate::workflow::parse_workflow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn walker() -> Walker {
        Walker::default()
    }

    fn wf(yaml: &str) -> Arc<Workflow> {
        Arc::new(parse_workflow(yaml).unwrap())
    }

    #[test]
    fn test_bindings_follow_declaration_order() {
        let workflow = wf(r#"
id: order
nodes:
  - { id: b, type: noop }
  - { id: a, type: noop }
  - { id: c, type: noop }
connections:
  - { from: a, to: c }
"#);
        let request = RunRequest::new(workflow.clone());
        let ids: Vec<String> = request.bindings().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let explicit = RunRequest::new(workflow)
            .with_start("c", vec![])
            .with_start("b", vec![]);
        let ids: Vec<String> = explicit.bindings().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_integrity_error_before_any_node_runs() {
        let workflow = wf(r#"
id: broken
nodes:
  - { id: a, type: noop }
connections:
  - { from: a, to: ghost }
"#);
        let err = walker().run(RunRequest::new(workflow)).await.unwrap_err();
        assert_eq!(err.code(), "GRAPH_INTEGRITY_ERROR");
    }

    #[tokio::test]
    async fn test_disabled_and_pinned_nodes() {
        let workflow = wf(r#"
id: bypass
nodes:
  - { id: start, type: manual_trigger }
  - id: fetch
    type: http
    parameters: { url: "http://127.0.0.1:9/never" }
    pinned_data: [{ id: 1 }, { id: 2 }]
  - id: fail
    type: stop_and_error
    disabled: true
connections:
  - { from: start, to: fetch }
  - { from: fetch, to: fail }
"#);
        let report = walker().run(RunRequest::new(workflow)).await.unwrap();
        assert!(report.is_success());

        let fetch = report.state.last_result("fetch").unwrap();
        assert_eq!(fetch.branch(0).len(), 2);
        let fail = report.state.last_result("fail").unwrap();
        assert_eq!(fail.status, ResultStatus::Skipped);
        assert_eq!(fail.branch(0)[1].json["id"], 2);
    }

    #[tokio::test]
    async fn test_error_payload_shape() {
        let workflow = wf(r#"
id: orders
name: Orders
settings: { error_workflow: on-error }
nodes:
  - { id: start, type: manual_trigger }
  - { id: boom, name: Explode, type: stop_and_error, parameters: { message: "kaput" } }
connections:
  - { from: start, to: boom }
"#);
        let report = walker().run(RunRequest::new(workflow.clone())).await.unwrap();
        assert_eq!(report.status(), RunStatus::Error);
        // no catalog configured: nothing dispatched
        assert!(report.error_workflow_run.is_none());

        let payload = error_payload(&workflow, &report.state);
        assert_eq!(payload["execution"]["error"]["node"], "Explode");
        assert_eq!(payload["execution"]["error"]["node_id"], "boom");
        assert_eq!(payload["execution"]["error"]["item_index"], 0);
        assert_eq!(payload["execution"]["last_node_executed"], "Explode");
        assert_eq!(payload["execution"]["completed_nodes"], json!(["start"]));
        assert_eq!(payload["workflow"]["name"], "Orders");
        assert!(payload["execution"]["error"]["message"]
            .as_str()
            .unwrap()
            .contains("kaput"));
    }

    #[tokio::test]
    async fn test_resume_rejects_runs_that_are_not_waiting() {
        let workflow = wf("id: w\nnodes:\n  - { id: a, type: noop }\n");
        let report = walker().run(RunRequest::new(workflow.clone())).await.unwrap();
        let err = walker()
            .resume(workflow, report.state, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not waiting"));
    }

    #[tokio::test]
    async fn test_loop_limit_fails_the_loop_target() {
        let workflow = wf(r#"
id: spin
settings: { max_loop_iterations: 2 }
nodes:
  - { id: start, type: manual_trigger }
  - { id: batches, type: split_in_batches, parameters: { batch_size: 1 } }
  - { id: work, type: noop }
connections:
  - { from: start, to: batches }
  - { from: batches, branch: 0, to: work }
  - { from: work, to: batches, kind: loop }
"#);
        let items = items_from_json((0..5).map(|i| json!({ "i": i })));
        let report = walker()
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        let failure = report.failure().unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("batches"));
        assert!(failure.message.contains("Loop limit of 2"));
    }

    type Log = Arc<Mutex<Vec<String>>>;

    /// Passes input 0 through, after an optional delay, and logs its node id.
    struct Recorder {
        log: Log,
    }

    #[async_trait]
    impl Node for Recorder {
        fn node_type(&self) -> &str {
            "recorder"
        }

        fn descriptor(&self, _params: &Value) -> NodeDescriptor {
            NodeDescriptor::batch()
        }

        async fn execute_batch(
            &self,
            params: &Value,
            inputs: &[ItemList],
            ctx: &NodeContext,
        ) -> Result<NodeOutput> {
            if let Some(ms) = params.get("delay_ms").and_then(|v| v.as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.log.lock().unwrap().push(ctx.node_id.to_string());
            Ok(NodeOutput::single(inputs[0].clone()))
        }
    }

    /// Fails while `failing` is set.
    struct Gate {
        calls: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Node for Gate {
        fn node_type(&self) -> &str {
            "gate"
        }

        fn descriptor(&self, _params: &Value) -> NodeDescriptor {
            NodeDescriptor::batch()
        }

        async fn execute_batch(
            &self,
            _params: &Value,
            inputs: &[ItemList],
            _ctx: &NodeContext,
        ) -> Result<NodeOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Node("upstream unavailable".to_string()));
            }
            Ok(NodeOutput::single(inputs[0].clone()))
        }
    }

    /// Fails items whose `fail` field is true.
    struct Picky;

    #[async_trait]
    impl Node for Picky {
        fn node_type(&self) -> &str {
            "picky"
        }

        async fn execute_item(
            &self,
            _params: &Value,
            item: &DataItem,
            _ctx: &NodeContext,
        ) -> Result<ItemOutput> {
            if item.json["fail"] == json!(true) {
                return Err(Error::Node(format!("bad item {}", item.json["i"])));
            }
            Ok(ItemOutput::main(item.clone()))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Node for Sleeper {
        fn node_type(&self) -> &str {
            "sleeper"
        }

        async fn execute_item(
            &self,
            _params: &Value,
            item: &DataItem,
            _ctx: &NodeContext,
        ) -> Result<ItemOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ItemOutput::main(item.clone()))
        }
    }

    struct Fixture {
        walker: Walker,
        log: Log,
        gate_calls: Arc<AtomicUsize>,
        gate_failing: Arc<AtomicBool>,
    }

    impl Fixture {
        fn logged(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn fixture() -> Fixture {
        let log: Log = Arc::default();
        let gate_calls = Arc::new(AtomicUsize::new(0));
        let gate_failing = Arc::new(AtomicBool::new(true));

        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(Recorder { log: log.clone() }));
        registry.register(Arc::new(Gate {
            calls: gate_calls.clone(),
            failing: gate_failing.clone(),
        }));
        registry.register(Arc::new(Picky));
        registry.register(Arc::new(Sleeper));

        Fixture {
            walker: Walker::new(registry),
            log,
            gate_calls,
            gate_failing,
        }
    }

    fn node_order(state: &RunState) -> Vec<&str> {
        state.results.iter().map(|r| r.node_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_linear_run_executes_every_node_once() {
        let fx = fixture();
        let workflow = wf(r#"
id: linear
nodes:
  - { id: start, type: manual_trigger }
  - { id: a, type: recorder }
  - { id: b, type: recorder }
connections:
  - { from: start, to: a }
  - { from: a, to: b }
"#);
        let items = items_from_json([json!({"n": 1}), json!({"n": 2})]);
        let report = fx
            .walker
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(fx.logged(), vec!["a", "b"]);
        assert_eq!(node_order(&report.state), vec!["start", "a", "b"]);
        assert!(report.state.results.iter().all(|r| r.run_index == 0));
        assert_eq!(report.state.last_result("b").unwrap().branch(0)[1].json["n"], 2);
        assert!(report.state.ready.is_empty());
        assert!(report.state.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_empty_branch_still_runs_and_merge_waits_for_both() {
        let fx = fixture();
        let workflow = wf(r#"
id: branching
nodes:
  - { id: start, type: manual_trigger }
  - id: big
    type: if
    parameters:
      conditions:
        - { left: "{{ $json.total }}", operator: gt, right: 100 }
  - { id: b, type: recorder }
  - { id: c, type: recorder }
  - { id: d, type: merge, parameters: { mode: append } }
connections:
  - { from: start, to: big }
  - { from: big, branch: 0, to: b }
  - { from: big, branch: 1, to: c }
  - { from: b, to: d, input: 0 }
  - { from: c, to: d, input: 1 }
"#);
        let items = items_from_json([json!({"total": 150}), json!({"total": 300})]);
        let report = fx
            .walker
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(node_order(&report.state), vec!["start", "big", "b", "c", "d"]);

        let big = report.state.last_result("big").unwrap();
        assert_eq!(big.branch(0).len(), 2);
        assert_eq!(big.branches[1], Some(vec![]));

        let c = report.state.last_result("c").unwrap();
        assert_eq!(c.status, ResultStatus::Success);
        assert!(c.branch(0).is_empty());

        let d = report.state.last_result("d").unwrap();
        assert_eq!(d.branch(0).len(), 2);
    }

    #[tokio::test]
    async fn test_expressions_read_earlier_output_without_changing_it() {
        let workflow = wf(r#"
id: purity
nodes:
  - { id: start, type: manual_trigger }
  - { id: a, name: Source, type: set, parameters: { values: { v: 1 } } }
  - id: b
    type: set
    parameters:
      values:
        v: 2
        from_source: '{{ $node["Source"].json.v }}'
connections:
  - { from: start, to: a }
  - { from: a, to: b }
"#);
        let report = walker().run(RunRequest::new(workflow)).await.unwrap();

        assert!(report.is_success());
        let b = report.state.last_result("b").unwrap();
        assert_eq!(b.branch(0)[0].json, json!({"v": 2, "from_source": 1}));
        let a = report.state.last_result("a").unwrap();
        assert_eq!(a.branch(0)[0].json, json!({"v": 1}));
        assert_eq!(report.state.outputs["a"].branch(0)[0].json, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts_then_fails_the_run() {
        let fx = fixture();
        let workflow = wf(r#"
id: retrying
nodes:
  - { id: start, type: manual_trigger }
  - id: g
    name: Gate
    type: gate
    retry: { max_attempts: 3, delay_ms: 1 }
  - { id: after, type: recorder }
connections:
  - { from: start, to: g }
  - { from: g, to: after }
"#);
        let report = fx.walker.run(RunRequest::new(workflow)).await.unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        assert_eq!(fx.gate_calls.load(Ordering::SeqCst), 3);
        assert!(fx.logged().is_empty());

        let result = report.state.last_result("g").unwrap();
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.attempts, 3);
        let err = result.error.as_ref().unwrap();
        assert_eq!(err.node_name, "Gate");
        assert_eq!(err.code, "NODE_ERROR");

        let failure = report.failure().unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("g"));
        assert!(failure.message.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn test_continue_per_item_drops_only_the_failed_item() {
        let fx = fixture();
        let workflow = wf(r#"
id: per-item
nodes:
  - { id: start, type: manual_trigger }
  - { id: e, type: picky, on_error: continue_per_item }
  - { id: after, type: recorder }
connections:
  - { from: start, to: e }
  - { from: e, to: after }
"#);
        let items = items_from_json((0..5).map(|i| json!({"i": i, "fail": i == 2})));
        let report = fx
            .walker
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        let e = report.state.last_result("e").unwrap();
        assert_eq!(e.item_errors.len(), 1);
        assert_eq!(e.item_errors[0].item_index, 2);
        assert!(e.item_errors[0].message.contains("bad item 2"));

        let after = report.state.last_result("after").unwrap();
        let seen: Vec<i64> = after
            .branch(0)
            .iter()
            .filter_map(|item| item.json["i"].as_i64())
            .collect();
        assert_eq!(seen, vec![0, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_error_workflow_receives_failure_context() {
        let alert = parse_workflow(
            r#"
id: alert
nodes:
  - { id: on_error, type: error_trigger }
  - id: summarize
    type: set
    parameters:
      keep_only_set: true
      values:
        failed_node: "{{ $json.execution.error.node }}"
        workflow: "{{ $json.workflow.id }}"
connections:
  - { from: on_error, to: summarize }
"#,
        )
        .unwrap();
        let walker = walker().with_catalog(Arc::new(InMemoryCatalog::new().with_workflow(alert)));

        let workflow = wf(r#"
id: orders
settings: { error_workflow: alert }
nodes:
  - { id: start, type: manual_trigger }
  - { id: boom, name: Explode, type: stop_and_error }
connections:
  - { from: start, to: boom }
"#);
        let report = walker.run(RunRequest::new(workflow)).await.unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        let handler = report.error_workflow_run.expect("error workflow should run");
        assert_eq!(handler.status, RunStatus::Success);
        assert_eq!(handler.mode, RunMode::ErrorHandler);
        assert_eq!(
            handler.last_result("summarize").unwrap().branch(0)[0].json,
            json!({"failed_node": "Explode", "workflow": "orders"})
        );
    }

    #[tokio::test]
    async fn test_failing_error_workflow_is_not_dispatched_again() {
        let fragile = parse_workflow(
            r#"
id: fragile
settings: { error_workflow: fragile }
nodes:
  - { id: boom, type: stop_and_error }
"#,
        )
        .unwrap();
        let walker =
            walker().with_catalog(Arc::new(InMemoryCatalog::new().with_workflow(fragile.clone())));

        let report = walker.run(RunRequest::new(fragile)).await.unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        let handler = report.error_workflow_run.unwrap();
        assert_eq!(handler.status, RunStatus::Error);
        assert_eq!(handler.mode, RunMode::ErrorHandler);
    }

    const PAUSE_WORKFLOW: &str = r#"
id: approval
nodes:
  - { id: start, type: manual_trigger }
  - id: hold
    name: Await Approval
    type: wait
    parameters: { mode: pause, reason: "needs approval" }
  - { id: after, type: recorder }
connections:
  - { from: start, to: hold }
  - { from: hold, to: after }
"#;

    #[tokio::test]
    async fn test_pause_then_resume_from_token() {
        let fx = fixture();
        let workflow = wf(PAUSE_WORKFLOW);
        let items = items_from_json([json!({"order": 7})]);
        let report = fx
            .walker
            .run(RunRequest::new(workflow.clone()).with_items(items))
            .await
            .unwrap();

        assert_eq!(report.status(), RunStatus::Waiting);
        assert!(report.state.finished_at.is_none());
        let waiting = report.state.waiting.as_ref().unwrap();
        assert_eq!(waiting.node_id, "hold");
        assert_eq!(waiting.reason, "needs approval");
        assert!(report.state.last_result("hold").is_none());
        assert!(fx.logged().is_empty());

        let token = report.resume_token().unwrap().unwrap();
        let state = RunState::from_resume_token(&token).unwrap();
        let resumed = fx.walker.resume(workflow, state, None).await.unwrap();

        assert!(resumed.is_success());
        assert_eq!(resumed.state.run_id, report.state.run_id);
        assert_eq!(fx.logged(), vec!["after"]);
        assert_eq!(resumed.state.results_for("start").len(), 1);
        assert_eq!(
            resumed.state.last_result("hold").unwrap().branch(0)[0].json["order"],
            7
        );
    }

    #[tokio::test]
    async fn test_resume_items_replace_the_waiting_output() {
        let fx = fixture();
        let workflow = wf(PAUSE_WORKFLOW);
        let report = fx
            .walker
            .run(RunRequest::new(workflow.clone()))
            .await
            .unwrap();

        let approved = items_from_json([json!({"approved": true})]);
        let resumed = fx
            .walker
            .resume(workflow, report.state, Some(approved))
            .await
            .unwrap();

        assert!(resumed.is_success());
        let after = resumed.state.last_result("after").unwrap();
        assert_eq!(after.branch(0)[0].json, json!({"approved": true}));
    }

    #[tokio::test]
    async fn test_resume_from_sqlite_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(&dir.path().join("runs.db")).unwrap();
        let fx = fixture();
        let walker = fx.walker.clone().with_sink(Arc::new(sink.clone()));
        let workflow = wf(PAUSE_WORKFLOW);

        let report = walker
            .run(RunRequest::new(workflow.clone()).with_run_id("run-approval"))
            .await
            .unwrap();
        assert_eq!(report.status(), RunStatus::Waiting);

        let resumed = walker
            .resume_from_sink(workflow.clone(), "run-approval", None)
            .await
            .unwrap();
        assert!(resumed.is_success());
        assert_eq!(fx.logged(), vec!["after"]);

        let results = sink.node_results("run-approval").await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["start", "hold", "after"]);

        let runs = sink.list_runs(&RunQuery::default()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);

        let err = walker
            .resume_from_sink(workflow, "run-approval", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not waiting"));
    }

    #[tokio::test]
    async fn test_cancel_stops_an_in_flight_run() {
        let fx = fixture();
        let workflow = wf(r#"
id: slow
nodes:
  - { id: start, type: manual_trigger }
  - { id: nap, type: sleeper }
connections:
  - { from: start, to: nap }
"#);
        let walker = fx.walker.clone();
        let handle =
            tokio::spawn(async move { walker.run(RunRequest::new(workflow).with_run_id("run-nap")).await });

        for _ in 0..200 {
            let active = fx.walker.cancel_registry().active_runs().await;
            if active.iter().any(|id| id == "run-nap") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // let the trigger finish so the sleeper is in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.walker.cancel("run-nap").await);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.status(), RunStatus::Cancelled);
        assert_eq!(report.failure().unwrap().code, "CANCELLED");
        assert_eq!(report.state.ready.front().map(String::as_str), Some("nap"));
        assert!(report.state.last_result("nap").is_none());
        assert!(fx.walker.cancel_registry().active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_timeout_ends_the_run_in_error() {
        let fx = fixture();
        let workflow = wf(r#"
id: too-slow
settings: { timeout_ms: 50 }
nodes:
  - { id: start, type: manual_trigger }
  - { id: nap, type: sleeper }
connections:
  - { from: start, to: nap }
"#);
        let report = fx.walker.run(RunRequest::new(workflow)).await.unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        assert_eq!(report.failure().unwrap().code, "RUN_TIMEOUT");
        assert!(report.state.finished_at.is_some());
        assert_eq!(report.state.ready.front().map(String::as_str), Some("nap"));
    }

    #[tokio::test]
    async fn test_split_in_batches_loop_collects_every_item() {
        let fx = fixture();
        let workflow = wf(r#"
id: batching
nodes:
  - { id: start, type: manual_trigger }
  - { id: batches, type: split_in_batches, parameters: { batch_size: 2 } }
  - { id: work, type: set, parameters: { values: { processed: true } } }
  - { id: after, type: recorder }
connections:
  - { from: start, to: batches }
  - { from: batches, branch: 0, to: work }
  - { from: work, to: batches, kind: loop }
  - { from: batches, branch: 1, to: after }
"#);
        let items = items_from_json((0..5).map(|i| json!({ "i": i })));
        let report = fx
            .walker
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(fx.logged(), vec!["after"]);
        assert_eq!(report.state.results_for("batches").len(), 4);
        let work_runs: Vec<u32> = report
            .state
            .results_for("work")
            .iter()
            .map(|r| r.run_index)
            .collect();
        assert_eq!(work_runs, vec![0, 1, 2]);

        let after = report.state.last_result("after").unwrap();
        assert_eq!(after.branch(0).len(), 5);
        assert!(after.branch(0).iter().all(|item| item.json["processed"] == true));
        assert!(!report.state.node_state.contains_key("batches"));
    }

    #[tokio::test]
    async fn test_loop_body_feeding_an_outside_merge_keeps_every_iteration() {
        let workflow = wf(r#"
id: batch-collect
nodes:
  - { id: start, type: manual_trigger }
  - { id: batches, type: split_in_batches, parameters: { batch_size: 2 } }
  - { id: work, type: set, parameters: { values: { processed: true } } }
  - { id: collect, type: merge, parameters: { mode: append } }
connections:
  - { from: start, to: batches }
  - { from: batches, branch: 0, to: work }
  - { from: work, to: batches, kind: loop }
  - { from: work, to: collect, input: 0 }
  - { from: batches, branch: 1, to: collect, input: 1 }
"#);
        let items = items_from_json((0..5).map(|i| json!({ "i": i })));
        let report = walker()
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.state.results_for("work").len(), 3);
        assert_eq!(report.state.results_for("collect").len(), 1);
        assert!(report.state.late_deliveries.is_empty());

        let collected = report.state.last_result("collect").unwrap().branch(0);
        assert_eq!(collected.len(), 10);
        let from_body: Vec<i64> = collected[..5]
            .iter()
            .map(|item| item.json["i"].as_i64().unwrap())
            .collect();
        assert_eq!(from_body, vec![0, 1, 2, 3, 4]);
        assert!(collected.iter().all(|item| item.json["processed"] == true));
    }

    #[tokio::test]
    async fn test_wait_any_merge_runs_once_and_records_late_delivery() {
        let fx = fixture();
        let workflow = wf(r#"
id: first-wins
nodes:
  - { id: start, type: manual_trigger }
  - id: big
    type: if
    parameters:
      conditions:
        - { left: "{{ $json.total }}", operator: gt, right: 100 }
  - { id: b, type: recorder }
  - { id: c, type: recorder }
  - { id: m, type: merge, parameters: { wait: any, mode: append } }
connections:
  - { from: start, to: big }
  - { from: big, branch: 0, to: b }
  - { from: b, to: c }
  - { from: c, to: m, input: 0 }
  - { from: big, branch: 1, to: m, input: 1 }
"#);
        let items = items_from_json([json!({"total": 150}), json!({"total": 300})]);
        let report = fx
            .walker
            .run(RunRequest::new(workflow).with_items(items))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(fx.logged(), vec!["b", "c"]);

        let merged = report.state.results_for("m");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, ResultStatus::Success);
        assert!(merged[0].branch(0).is_empty());

        assert_eq!(report.state.late_deliveries.len(), 1);
        let late = &report.state.late_deliveries[0];
        assert_eq!(late.node_id, "m");
        assert_eq!(late.input, 0);
        assert_eq!(late.items.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_run_resumes_at_the_failed_node() {
        let fx = fixture();
        let workflow = wf(r#"
id: flaky
nodes:
  - { id: start, type: manual_trigger }
  - { id: a, type: recorder }
  - { id: g, type: gate }
  - { id: b, type: recorder }
connections:
  - { from: start, to: a }
  - { from: a, to: g }
  - { from: g, to: b }
"#);
        let first = fx
            .walker
            .run(RunRequest::new(workflow.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), RunStatus::Error);
        assert_eq!(fx.logged(), vec!["a"]);

        fx.gate_failing.store(false, Ordering::SeqCst);
        let retried = fx
            .walker
            .retry_run(workflow.clone(), &first.state)
            .await
            .unwrap();

        assert!(retried.is_success());
        assert_eq!(fx.logged(), vec!["a", "b"]);
        assert_eq!(retried.state.mode, RunMode::Retry);
        assert_ne!(retried.state.run_id, first.state.run_id);
        assert_eq!(retried.state.metadata["retry_of"], json!(first.state.run_id));

        let gate_results = retried.state.results_for("g");
        assert_eq!(gate_results.len(), 1);
        assert_eq!(gate_results[0].status, ResultStatus::Success);
        assert_eq!(gate_results[0].run_index, 0);
        assert_eq!(gate_results[0].branch(0).len(), 1);

        let err = fx
            .walker
            .retry_run(workflow, &retried.state)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only failed or cancelled"));
    }

    #[tokio::test]
    async fn test_parallel_wave_applies_results_in_dequeue_order() {
        let fx = fixture();
        let workflow = wf(r#"
id: fan-out
settings: { parallel_branches: true }
nodes:
  - { id: start, type: manual_trigger }
  - { id: x, type: recorder, parameters: { delay_ms: 80 } }
  - { id: y, type: recorder, parameters: { delay_ms: 40 } }
  - { id: z, type: recorder }
connections:
  - { from: start, to: x }
  - { from: start, to: y }
  - { from: start, to: z }
"#);
        let report = fx.walker.run(RunRequest::new(workflow)).await.unwrap();

        assert!(report.is_success());
        // finish order
        assert_eq!(fx.logged(), vec!["z", "y", "x"]);
        assert_eq!(node_order(&report.state), vec!["start", "x", "y", "z"]);
    }
}

//! Execution sinks: where the walker reports progress and persists run state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::{ExecutionResult, RunState};
use crate::error::Result;

/// Receiver of run progress.
///
/// The walker calls `record_result` after every node execution (live
/// progress) and `save_state` whenever the run stops: terminal, waiting or
/// cancelled. Errors returned here are logged by the walker and never fail
/// the run.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// A run (new, resumed or retried) is about to execute.
    async fn run_started(&self, state: &RunState) -> Result<()>;

    /// One node execution finished.
    async fn record_result(&self, run_id: &str, result: &ExecutionResult) -> Result<()>;

    /// Persist the full run state.
    async fn save_state(&self, state: &RunState) -> Result<()>;

    /// Load a previously saved run state.
    async fn load_state(&self, run_id: &str) -> Result<Option<RunState>>;
}

/// In-memory sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    states: Arc<Mutex<HashMap<String, RunState>>>,
    results: Arc<Mutex<HashMap<String, Vec<ExecutionResult>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Results streamed for a run, in arrival order.
    pub async fn results(&self, run_id: &str) -> Vec<ExecutionResult> {
        self.results
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of runs with saved state, sorted.
    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ExecutionSink for MemorySink {
    async fn run_started(&self, state: &RunState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn record_result(&self, run_id: &str, result: &ExecutionResult) -> Result<()> {
        self.results
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn save_state(&self, state: &RunState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_state(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(self.states.lock().await.get(run_id).cloned())
    }
}

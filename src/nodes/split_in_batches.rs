//! Split-in-batches node - loop control over an item list.
//!
//! On the first visit the incoming items are stored in node state and the
//! first batch is emitted on the `loop` output. The loop body returns to this
//! node over a loop connection; every return visit collects the body's items
//! and emits the next batch. When nothing remains, everything collected is
//! emitted on `done` and the state is cleared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::{ItemList, Node, NodeContext, NodeDescriptor, NodeOutput, StateChange};
use crate::error::{Error, Result};

/// Output index of the current batch.
pub const LOOP_BRANCH: usize = 0;
/// Output index of the collected results.
pub const DONE_BRANCH: usize = 1;

/// Split-in-batches node implementation.
pub struct SplitInBatchesNode;

impl SplitInBatchesNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SplitInBatchesNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SplitConfig {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

fn default_batch_size() -> usize {
    10
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoopState {
    remaining: ItemList,
    processed: ItemList,
    #[serde(default)]
    batches: u32,
}

#[async_trait]
impl Node for SplitInBatchesNode {
    fn node_type(&self) -> &str {
        "split_in_batches"
    }

    fn description(&self) -> &str {
        "Emit items in batches on 'loop' until exhausted, then everything on 'done'"
    }

    fn descriptor(&self, _params: &Value) -> NodeDescriptor {
        NodeDescriptor::batch().with_outputs(["loop", "done"])
    }

    async fn execute_batch(
        &self,
        params: &Value,
        inputs: &[ItemList],
        ctx: &NodeContext,
    ) -> Result<NodeOutput> {
        let config: SplitConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid split_in_batches config: {}", e)))?;
        if config.batch_size == 0 {
            return Err(Error::Node("batch_size must be at least 1".to_string()));
        }

        let incoming = inputs.first().cloned().unwrap_or_default();

        let mut state = match &ctx.state {
            // Returning from the loop body: the input holds processed items.
            Some(raw) => {
                let mut state: LoopState = serde_json::from_value(raw.clone()).map_err(|e| {
                    Error::Node(format!("Corrupt split_in_batches state: {}", e))
                })?;
                state.processed.extend(incoming);
                state
            }
            None => LoopState {
                remaining: incoming,
                ..LoopState::default()
            },
        };

        if state.remaining.is_empty() {
            debug!(
                node = %ctx.node_name,
                batches = state.batches,
                "split_in_batches finished"
            );
            return Ok(NodeOutput::inactive(2)
                .with_branch(DONE_BRANCH, state.processed)
                .with_state(StateChange::Clear));
        }

        let take = config.batch_size.min(state.remaining.len());
        let batch: ItemList = state.remaining.drain(..take).collect();
        state.batches += 1;

        let encoded = serde_json::to_value(&state)?;
        Ok(NodeOutput::inactive(2)
            .with_branch(LOOP_BRANCH, batch)
            .with_state(StateChange::Set(encoded)))
    }
}

//! Wait node - delay the run or pause it until resumed.
//!
//! `sleep` holds the node for a bounded duration and passes the items on.
//! `pause` suspends the whole run; the engine persists the run state and the
//! node completes when the run is resumed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::types::{ItemList, Node, NodeContext, NodeDescriptor, NodeOutput, Suspend};
use crate::error::{Error, Result};

/// Wait node implementation.
pub struct WaitNode;

impl WaitNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WaitNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum WaitMode {
    #[default]
    Sleep,
    Pause,
}

#[derive(Debug, Deserialize)]
struct WaitConfig {
    #[serde(default)]
    mode: WaitMode,

    /// Duration to wait in milliseconds
    #[serde(default)]
    amount_ms: Option<u64>,

    /// Duration to wait in seconds (can be fractional)
    #[serde(default)]
    seconds: Option<f64>,

    /// Wait until an RFC 3339 timestamp
    #[serde(default)]
    until: Option<String>,

    /// Shown in the waiting record of a paused run
    #[serde(default)]
    reason: Option<String>,
}

/// Sleeps longer than this are rejected; use `pause` instead.
const MAX_WAIT_MS: u64 = 60 * 60 * 1000;

#[async_trait]
impl Node for WaitNode {
    fn node_type(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Sleep for a duration, or pause the run until it is resumed"
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
        let config: WaitConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid wait config: {}", e)))?;
        let items = inputs.first().cloned().unwrap_or_default();

        match config.mode {
            WaitMode::Pause => {
                let resume_at = config.until.as_deref().map(parse_until).transpose()?;
                info!(
                    "Wait node '{}' pausing run {} (resume_at: {:?})",
                    ctx.node_name, ctx.run_id, resume_at
                );
                Ok(NodeOutput::single(items).suspended(Suspend {
                    resume_at,
                    reason: config
                        .reason
                        .unwrap_or_else(|| "waiting for resume".to_string()),
                }))
            }
            WaitMode::Sleep => {
                let wait_ms = calculate_wait_duration(&config, Utc::now())?;
                if wait_ms > 0 {
                    info!(
                        "Wait node '{}' sleeping for {}ms (run: {})",
                        ctx.node_name, wait_ms, ctx.run_id
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
                }
                Ok(NodeOutput::single(items))
            }
        }
    }
}

fn parse_until(until: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(until)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Node(format!("Invalid 'until' timestamp '{}': {}", until, e)))
}

/// Calculate the sleep duration in milliseconds.
fn calculate_wait_duration(config: &WaitConfig, now: DateTime<Utc>) -> Result<u64> {
    if let Some(until) = &config.until {
        let target = parse_until(until)?;
        if target <= now {
            return Ok(0);
        }
        let total_ms = (target - now).num_milliseconds() as u64;
        return check_max(total_ms);
    }

    let mut total_ms: u64 = config.amount_ms.unwrap_or(0);
    if let Some(seconds) = config.seconds {
        if seconds < 0.0 {
            return Err(Error::Node("Wait duration cannot be negative".to_string()));
        }
        total_ms = total_ms.saturating_add((seconds * 1000.0) as u64);
    }

    check_max(total_ms)
}

fn check_max(total_ms: u64) -> Result<u64> {
    if total_ms > MAX_WAIT_MS {
        return Err(Error::Node(format!(
            "Wait duration {}ms exceeds maximum of {}ms, use mode: pause",
            total_ms, MAX_WAIT_MS
        )));
    }
    Ok(total_ms)
}

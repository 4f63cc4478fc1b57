//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{RunFailure, RunMode, RunStatus};

/// One row of the `runs` table, without the serialized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<RunFailure>,
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub started_after: Option<DateTime<Utc>>,
    /// 0 means the default limit
    pub limit: usize,
    pub offset: usize,
}

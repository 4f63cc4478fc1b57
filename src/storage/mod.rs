//! Persistence of run progress and run state.

mod models;
mod sink;
mod sqlite;

pub use models::*;
pub use sink::{ExecutionSink, MemorySink};
pub use sqlite::SqliteSink;

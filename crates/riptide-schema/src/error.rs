//! Schema and decoding errors.

use riptide_core::model::{TableId, Ts};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    /// A DDL job arrived at or below the snapshot's current version.
    /// Schema inconsistency: the changefeed must stop.
    #[error("ddl job {job_id} at ts {finished_ts} applied out of order (snapshot at {version})")]
    OutOfOrderDdl {
        job_id: i64,
        finished_ts: Ts,
        version: Ts,
    },

    #[error("table not found: {0}")]
    TableNotFound(TableId),

    #[error("table not found: {0}.{1}")]
    TableNameNotFound(String, String),

    #[error("table already exists: {0}")]
    TableExists(TableId),

    /// The DDL job is missing the payload its action requires.
    #[error("malformed ddl job {job_id}: {reason}")]
    MalformedJob { job_id: i64, reason: String },

    #[error("row decode error: {0}")]
    Decode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

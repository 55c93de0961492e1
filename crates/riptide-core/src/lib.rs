//! # riptide-core - Data model for the riptide replication service
//!
//! Shared types used across every riptide crate:
//!
//! - Timestamps, key spans and raw KV change entries as delivered by the
//!   upstream storage layer
//! - Decoded row/DDL change events
//! - Changefeed configuration and the persisted coordination state
//!   (status, task assignments, task positions)
//! - Table filtering and transaction filtering
//! - The error taxonomy and retry helpers

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod retry;

pub use config::{CyclicConfig, FilterConfig, ReplicaConfig, SinkConfig};
pub use error::{CoreError, Result};
pub use filter::TableFilter;
pub use model::{
    AdminJobType, CaptureId, CaptureInfo, ChangeFeedId, ChangeFeedInfo, ChangeFeedState,
    ChangeFeedStatus, ColumnInfo, ColumnType, ColumnValue, DDLEvent, DdlAction, DdlJob, OpType,
    OperationStatus, RawKVEntry, RawTxn, RegionId, RowChangedEvent, RowKind, Span, TableId,
    TableInfo, TableOperation, TaskPosition, TaskStatus, TaskWorkload, Ts, Txn, WorkloadInfo,
};

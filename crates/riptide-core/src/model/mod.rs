//! Data model shared by the puller, processor, owner and sinks.

mod changefeed;
mod ddl;
mod event;
mod kv;
mod span;
mod task;
mod ts;

pub use changefeed::{
    AdminJobType, ChangeFeedId, ChangeFeedInfo, ChangeFeedState, ChangeFeedStatus,
};
pub use ddl::{ColumnInfo, ColumnType, DdlAction, DdlJob, TableInfo};
pub use event::{ColumnValue, DDLEvent, RowChangedEvent, RowKind, Txn};
pub use kv::{OpType, RawKVEntry, RawTxn, RegionId};
pub use span::Span;
pub use task::{
    CaptureId, CaptureInfo, OperationStatus, TableId, TableOperation, TaskPosition, TaskStatus,
    TaskWorkload, WorkloadInfo,
};
pub use ts::Ts;

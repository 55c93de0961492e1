//! Owner/processor coordination state: task assignments and positions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Ts;

/// Physical table identifier assigned by the upstream schema library.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TableId(pub i64);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a capture process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureId(pub String);

impl CaptureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for CaptureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CaptureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A capture process registered in the metadata store under a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub id: CaptureId,
    #[serde(rename = "advertise-addr")]
    pub advertise_addr: String,
}

/// Progress of a table operation queued by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Queued by the owner, not yet picked up by the processor.
    Pending,
    /// The processor has started (add) or begun draining (delete).
    Processed,
    /// The processor has completed the operation.
    Finished,
}

/// An add/delete table operation inside a [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOperation {
    /// True for delete, false for add.
    pub delete: bool,
    /// Add: replicate from this ts. Delete: drain through this ts before
    /// tearing the pipeline down.
    #[serde(rename = "boundary-ts")]
    pub boundary_ts: Ts,
    pub status: OperationStatus,
}

impl TableOperation {
    pub fn add(boundary_ts: Ts) -> Self {
        Self {
            delete: false,
            boundary_ts,
            status: OperationStatus::Pending,
        }
    }

    pub fn delete(boundary_ts: Ts) -> Self {
        Self {
            delete: true,
            boundary_ts,
            status: OperationStatus::Pending,
        }
    }
}

/// Owner-to-processor table assignment for one (changefeed, capture).
///
/// A table id appears in `tables` iff its add operation finished or its
/// delete operation has not: in-flight adds live only in `operation`, and
/// deletes keep the table listed until the drain completes. Queuing an
/// operation for a table that already has one cancels the earlier
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskStatus {
    /// Assigned tables and the ts each one starts replicating from.
    #[serde(default)]
    pub tables: BTreeMap<TableId, Ts>,
    #[serde(default)]
    pub operation: BTreeMap<TableId, TableOperation>,
}

impl TaskStatus {
    /// Queue an add. The table joins `tables` once the processor finishes
    /// the operation.
    pub fn queue_add(&mut self, table_id: TableId, start_ts: Ts) {
        self.operation.insert(table_id, TableOperation::add(start_ts));
    }

    /// Queue a delete. The table leaves `tables` once the drain finishes.
    pub fn queue_delete(&mut self, table_id: TableId, boundary_ts: Ts) {
        self.operation
            .insert(table_id, TableOperation::delete(boundary_ts));
    }

    /// Ids of tables with an in-flight (unfinished) add operation.
    pub fn pending_add_tables(&self) -> impl Iterator<Item = (TableId, Ts)> + '_ {
        self.operation
            .iter()
            .filter(|(_, op)| !op.delete && op.status != OperationStatus::Finished)
            .map(|(id, op)| (*id, op.boundary_ts))
    }

    pub fn pending_op_count(&self) -> usize {
        self.operation
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .count()
    }

    pub fn has_pending_op(&self) -> bool {
        self.pending_op_count() > 0
    }

    /// Fold finished operations into `tables` and drop them. Returns true
    /// when anything changed, so the caller knows to persist.
    pub fn apply_finished_ops(&mut self) -> bool {
        let finished: Vec<(TableId, TableOperation)> = self
            .operation
            .iter()
            .filter(|(_, op)| op.status == OperationStatus::Finished)
            .map(|(id, op)| (*id, *op))
            .collect();
        for (table_id, op) in &finished {
            if op.delete {
                self.tables.remove(table_id);
            } else {
                self.tables.insert(*table_id, op.boundary_ts);
            }
            self.operation.remove(table_id);
        }
        !finished.is_empty()
    }

    /// The smallest boundary-ts among unfinished operations, used to clamp
    /// the changefeed timestamps while a move is in flight.
    pub fn min_unfinished_boundary_ts(&self) -> Option<Ts> {
        self.operation
            .values()
            .filter(|op| op.status != OperationStatus::Finished)
            .map(|op| op.boundary_ts)
            .min()
    }
}

/// Processor-to-owner progress report for one (changefeed, capture).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskPosition {
    /// All events with `commit_ts <= checkpoint_ts` are durable downstream.
    #[serde(rename = "checkpoint-ts")]
    pub checkpoint_ts: Ts,
    /// All events with `commit_ts <= resolved_ts` have been received.
    #[serde(rename = "resolved-ts")]
    pub resolved_ts: Ts,
    /// Transactions emitted so far.
    #[serde(default)]
    pub count: u64,
    /// Set when the processor hit a terminal error the owner must observe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-table load figure reported by a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkloadInfo {
    pub workload: u64,
}

/// Processor-to-owner workload report used by periodic rebalance.
pub type TaskWorkload = BTreeMap<TableId, WorkloadInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_add_then_delete_cancels() {
        let mut status = TaskStatus::default();
        status.queue_add(TableId(1), Ts::new(100));
        // In-flight adds live only in the operation map.
        assert!(!status.tables.contains_key(&TableId(1)));
        assert!(!status.operation[&TableId(1)].delete);

        // The delete replaces the pending add outright.
        status.queue_delete(TableId(1), Ts::new(200));
        let op = status.operation[&TableId(1)];
        assert!(op.delete);
        assert_eq!(op.boundary_ts, Ts::new(200));
        assert_eq!(status.operation.len(), 1);
    }

    #[test]
    fn test_apply_finished_ops_folds_into_tables() {
        let mut status = TaskStatus::default();
        status.queue_add(TableId(1), Ts::new(100));
        status.queue_add(TableId(2), Ts::new(150));
        assert_eq!(status.pending_op_count(), 2);
        assert_eq!(
            status.pending_add_tables().collect::<Vec<_>>(),
            vec![(TableId(1), Ts::new(100)), (TableId(2), Ts::new(150))]
        );

        status.operation.get_mut(&TableId(1)).unwrap().status = OperationStatus::Finished;
        assert_eq!(status.pending_op_count(), 1);
        assert_eq!(status.min_unfinished_boundary_ts(), Some(Ts::new(150)));

        assert!(status.apply_finished_ops());
        assert_eq!(status.tables.get(&TableId(1)), Some(&Ts::new(100)));
        assert_eq!(status.operation.len(), 1);
        assert!(!status.apply_finished_ops());

        // A finished delete removes the table.
        status.operation.get_mut(&TableId(2)).unwrap().status = OperationStatus::Finished;
        status.apply_finished_ops();
        status.queue_delete(TableId(1), Ts::new(300));
        assert!(status.tables.contains_key(&TableId(1)));
        status.operation.get_mut(&TableId(1)).unwrap().status = OperationStatus::Finished;
        assert!(status.apply_finished_ops());
        assert!(!status.tables.contains_key(&TableId(1)));
    }

    #[test]
    fn test_json_shape_kebab_case() {
        let mut status = TaskStatus::default();
        status.queue_add(TableId(5), Ts::new(42));
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"boundary-ts\":42"), "{json}");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }
}

//! The mounter: raw transactions to typed row changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use riptide_core::model::{
    ColumnValue, DDLEvent, DdlJob, OpType, RawKVEntry, RawTxn, RowChangedEvent, RowKind, Span, Txn,
};
use tracing::debug;

use crate::error::{Result, SchemaError};
use crate::rowcodec;
use crate::snapshot::{SchemaInfoGetter, SchemaSnapshot};

/// Decode a DDL job from an entry on the schema change span.
///
/// Returns `None` for resolved ticks and for entries that do not carry a
/// finished job.
pub fn unmarshal_ddl(entry: &RawKVEntry) -> Result<Option<DdlJob>> {
    if entry.op_type != OpType::Put {
        return Ok(None);
    }
    if entry.value.is_empty() {
        return Ok(None);
    }
    let mut job: DdlJob = serde_json::from_slice(&entry.value)?;
    // The job's effective timestamp is the commit of the entry that
    // recorded its completion.
    if job.finished_ts.is_zero() {
        job.finished_ts = entry.commit_ts;
    }
    Ok(Some(job))
}

/// Joins raw entries with the schema snapshot valid at their commit-ts.
///
/// The snapshot is shared with whichever task applies DDL jobs; the
/// pipeline pauses DML progress at a DDL barrier, so by the time a row at
/// `commit_ts` reaches the mounter the snapshot version is at least the
/// last DDL below that ts.
pub struct Mounter {
    snapshot: Arc<RwLock<SchemaSnapshot>>,
    ddl_span: Span,
}

impl Mounter {
    pub fn new(snapshot: Arc<RwLock<SchemaSnapshot>>) -> Self {
        Self {
            snapshot,
            ddl_span: Span::ddl_span(),
        }
    }

    pub fn snapshot(&self) -> &Arc<RwLock<SchemaSnapshot>> {
        &self.snapshot
    }

    /// Mount one raw transaction. Resolved ticks come back as empty
    /// transactions carrying only the commit-ts.
    pub fn mount(&self, raw: RawTxn) -> Result<Txn> {
        let mut txn = Txn {
            commit_ts: raw.commit_ts,
            dmls: Vec::new(),
            ddl: None,
        };
        for entry in &raw.entries {
            if self.ddl_span.contains(&entry.key) {
                if let Some(job) = unmarshal_ddl(entry)? {
                    txn.ddl = Some(DDLEvent::from_job(job));
                }
                continue;
            }
            if let Some(row) = self.mount_row(entry)? {
                txn.dmls.push(row);
            }
        }
        Ok(txn)
    }

    fn mount_row(&self, entry: &RawKVEntry) -> Result<Option<RowChangedEvent>> {
        let (table_id, handle) = rowcodec::decode_row_key(&entry.key)?;
        let snapshot = self.snapshot.read();
        let info = snapshot
            .table_by_id(table_id)
            .ok_or(SchemaError::TableNotFound(table_id))?;
        if snapshot.is_ineligible_table_id(table_id) {
            // No usable unique key: the row can never be applied
            // idempotently downstream, so it is dropped here.
            debug!(table = %table_id, "skipping row of ineligible table");
            return Ok(None);
        }

        let event = match entry.op_type {
            OpType::Put => {
                let decoded = rowcodec::decode_row_value(&entry.value)?;
                let mut columns = BTreeMap::new();
                // Only writable (public, non-generated) columns survive.
                for col in info.writable_columns() {
                    if let Some(value) = decoded.get(&col.name) {
                        columns.insert(col.name.clone(), value.clone());
                    }
                }
                RowChangedEvent {
                    schema: info.schema_name.clone(),
                    table: info.table_name.clone(),
                    kind: RowKind::Insert,
                    commit_ts: entry.commit_ts,
                    columns,
                }
            }
            OpType::Delete => {
                // Deletes address the row by handle; the unique-key column
                // is reconstructed from the key.
                let mut columns = BTreeMap::new();
                let key_col = info.pk_handle.clone().ok_or_else(|| {
                    SchemaError::Decode(format!("delete for table {table_id} without pk handle"))
                })?;
                columns.insert(key_col, ColumnValue::Int(handle));
                RowChangedEvent {
                    schema: info.schema_name.clone(),
                    table: info.table_name.clone(),
                    kind: RowKind::Delete,
                    commit_ts: entry.commit_ts,
                    columns,
                }
            }
            OpType::Resolved => return Ok(None),
        };
        Ok(Some(event))
    }
}

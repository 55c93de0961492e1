//! Point-in-time schema snapshot.

use std::collections::{HashMap, HashSet};

use riptide_core::model::{DdlAction, DdlJob, TableId, TableInfo, Ts};
use tracing::debug;

use crate::error::{Result, SchemaError};

/// Lookup surface the mounter and sinks need from a schema snapshot.
pub trait SchemaInfoGetter: Send + Sync {
    fn table_by_id(&self, id: TableId) -> Option<TableInfo>;
    fn table_id_by_name(&self, schema: &str, table: &str) -> Option<TableId>;
    /// Tables without a usable unique key cannot be replicated row-wise.
    fn is_ineligible_table_id(&self, id: TableId) -> bool;
}

/// Table ids a DDL job added to / removed from the replicated set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added: Vec<TableId>,
    pub dropped: Vec<TableId>,
}

/// Schema state valid at [`SchemaSnapshot::version`].
///
/// DDL jobs must be applied strictly in finished-ts order; an out-of-order
/// job is a schema inconsistency and poisons the changefeed.
#[derive(Debug, Default, Clone)]
pub struct SchemaSnapshot {
    tables: HashMap<TableId, TableInfo>,
    name_index: HashMap<(String, String), TableId>,
    ineligible: HashSet<TableId>,
    schemas: HashSet<String>,
    version: Ts,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a snapshot from a known table set, e.g. the state at a
    /// changefeed's start-ts.
    pub fn with_tables(tables: Vec<TableInfo>, version: Ts) -> Self {
        let mut snap = Self {
            version,
            ..Default::default()
        };
        for info in tables {
            snap.insert_table(info);
        }
        snap
    }

    pub fn version(&self) -> Ts {
        self.version
    }

    /// Ids of all tables currently in the replicated set.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.keys().copied().collect()
    }

    fn insert_table(&mut self, info: TableInfo) {
        let id = info.id;
        self.name_index
            .insert((info.schema_name.clone(), info.table_name.clone()), id);
        self.schemas.insert(info.schema_name.clone());
        if info.has_usable_unique_key() {
            self.ineligible.remove(&id);
        } else {
            self.ineligible.insert(id);
        }
        self.tables.insert(id, info);
    }

    fn remove_table(&mut self, id: TableId) -> Option<TableInfo> {
        let info = self.tables.remove(&id)?;
        self.name_index
            .remove(&(info.schema_name.clone(), info.table_name.clone()));
        self.ineligible.remove(&id);
        Some(info)
    }

    fn require_table_info(job: &DdlJob) -> Result<TableInfo> {
        job.table_info.clone().ok_or(SchemaError::MalformedJob {
            job_id: job.id,
            reason: "missing table-info".into(),
        })
    }

    /// Apply one finished DDL job, advancing the snapshot version.
    ///
    /// Returns the table-set changes so the owner can queue table
    /// additions and cleanups.
    pub fn apply(&mut self, job: &DdlJob) -> Result<SchemaDiff> {
        if job.finished_ts <= self.version {
            return Err(SchemaError::OutOfOrderDdl {
                job_id: job.id,
                finished_ts: job.finished_ts,
                version: self.version,
            });
        }

        let mut diff = SchemaDiff::default();
        match job.action {
            DdlAction::CreateSchema => {
                self.schemas.insert(job.schema_name.clone());
            }
            DdlAction::DropSchema => {
                let dropped: Vec<TableId> = self
                    .tables
                    .values()
                    .filter(|t| t.schema_name == job.schema_name)
                    .map(|t| t.id)
                    .collect();
                for id in dropped {
                    self.remove_table(id);
                    diff.dropped.push(id);
                }
                self.schemas.remove(&job.schema_name);
            }
            DdlAction::CreateTable => {
                let info = Self::require_table_info(job)?;
                if self.tables.contains_key(&info.id) {
                    return Err(SchemaError::TableExists(info.id));
                }
                diff.added.push(info.id);
                self.insert_table(info);
            }
            DdlAction::DropTable => {
                self.remove_table(job.table_id)
                    .ok_or(SchemaError::TableNotFound(job.table_id))?;
                diff.dropped.push(job.table_id);
            }
            DdlAction::TruncateTable => {
                // Truncate retires the physical table and creates a fresh
                // one under a new id.
                self.remove_table(job.table_id)
                    .ok_or(SchemaError::TableNotFound(job.table_id))?;
                diff.dropped.push(job.table_id);
                let new_id = job.new_table_id.ok_or(SchemaError::MalformedJob {
                    job_id: job.id,
                    reason: "truncate without new-table-id".into(),
                })?;
                let mut info = Self::require_table_info(job)?;
                info.id = new_id;
                diff.added.push(new_id);
                self.insert_table(info);
            }
            DdlAction::RenameTable
            | DdlAction::AddColumn
            | DdlAction::DropColumn
            | DdlAction::ModifyColumn
            | DdlAction::AddIndex
            | DdlAction::DropIndex => {
                self.remove_table(job.table_id)
                    .ok_or(SchemaError::TableNotFound(job.table_id))?;
                let info = Self::require_table_info(job)?;
                self.insert_table(info);
            }
        }

        self.version = job.finished_ts;
        debug!(
            job = job.id,
            action = ?job.action,
            version = %self.version,
            "applied ddl job to snapshot"
        );
        Ok(diff)
    }
}

/// Shared snapshots advanced by one task and read by others (the mounter,
/// the message-bus encoder) go through a lock.
impl SchemaInfoGetter for parking_lot::RwLock<SchemaSnapshot> {
    fn table_by_id(&self, id: TableId) -> Option<TableInfo> {
        self.read().table_by_id(id)
    }

    fn table_id_by_name(&self, schema: &str, table: &str) -> Option<TableId> {
        self.read().table_id_by_name(schema, table)
    }

    fn is_ineligible_table_id(&self, id: TableId) -> bool {
        self.read().is_ineligible_table_id(id)
    }
}

impl SchemaInfoGetter for SchemaSnapshot {
    fn table_by_id(&self, id: TableId) -> Option<TableInfo> {
        self.tables.get(&id).cloned()
    }

    fn table_id_by_name(&self, schema: &str, table: &str) -> Option<TableId> {
        self.name_index
            .get(&(schema.to_string(), table.to_string()))
            .copied()
    }

    fn is_ineligible_table_id(&self, id: TableId) -> bool {
        self.ineligible.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::model::{ColumnInfo, ColumnType};

    fn table_info(id: i64, schema: &str, name: &str, with_pk: bool) -> TableInfo {
        TableInfo {
            id: TableId(id),
            schema_name: schema.into(),
            table_name: name.into(),
            columns: vec![ColumnInfo {
                id: 1,
                name: "id".into(),
                col_type: ColumnType::Int,
                primary_key: with_pk,
                unique: with_pk,
                generated: false,
                public: true,
                nullable: false,
            }],
            pk_handle: with_pk.then(|| "id".to_string()),
        }
    }

    fn create_job(job_id: i64, id: i64, name: &str, ts: u64) -> DdlJob {
        DdlJob {
            id: job_id,
            schema_name: "test".into(),
            table_name: name.into(),
            table_id: TableId(id),
            action: DdlAction::CreateTable,
            query: format!("CREATE TABLE test.{name}(id int primary key)"),
            finished_ts: Ts::new(ts),
            table_info: Some(table_info(id, "test", name, true)),
            new_table_id: None,
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let mut snap = SchemaSnapshot::new();
        let diff = snap.apply(&create_job(1, 10, "t", 100)).unwrap();
        assert_eq!(diff.added, vec![TableId(10)]);
        assert_eq!(snap.version(), Ts::new(100));
        assert_eq!(snap.table_id_by_name("test", "t"), Some(TableId(10)));
        assert!(snap.table_by_id(TableId(10)).is_some());
        assert!(!snap.is_ineligible_table_id(TableId(10)));
    }

    #[test]
    fn test_out_of_order_job_rejected() {
        let mut snap = SchemaSnapshot::new();
        snap.apply(&create_job(1, 10, "t", 100)).unwrap();
        let err = snap.apply(&create_job(2, 11, "u", 100)).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfOrderDdl { .. }));
        // Version is untouched after a rejected job.
        assert_eq!(snap.version(), Ts::new(100));
    }

    #[test]
    fn test_drop_table() {
        let mut snap = SchemaSnapshot::new();
        snap.apply(&create_job(1, 10, "t", 100)).unwrap();
        let drop = DdlJob {
            action: DdlAction::DropTable,
            finished_ts: Ts::new(200),
            table_info: None,
            query: "DROP TABLE test.t".into(),
            ..create_job(2, 10, "t", 200)
        };
        let diff = snap.apply(&drop).unwrap();
        assert_eq!(diff.dropped, vec![TableId(10)]);
        assert!(snap.table_by_id(TableId(10)).is_none());
        assert_eq!(snap.table_id_by_name("test", "t"), None);
    }

    #[test]
    fn test_truncate_swaps_physical_id() {
        let mut snap = SchemaSnapshot::new();
        snap.apply(&create_job(1, 10, "t", 100)).unwrap();
        let truncate = DdlJob {
            action: DdlAction::TruncateTable,
            finished_ts: Ts::new(200),
            new_table_id: Some(TableId(11)),
            ..create_job(2, 10, "t", 200)
        };
        let diff = snap.apply(&truncate).unwrap();
        assert_eq!(diff.dropped, vec![TableId(10)]);
        assert_eq!(diff.added, vec![TableId(11)]);
        assert_eq!(snap.table_id_by_name("test", "t"), Some(TableId(11)));
    }

    #[test]
    fn test_drop_schema_drops_all_tables() {
        let mut snap = SchemaSnapshot::new();
        snap.apply(&create_job(1, 10, "a", 100)).unwrap();
        snap.apply(&create_job(2, 11, "b", 200)).unwrap();
        let drop = DdlJob {
            action: DdlAction::DropSchema,
            table_name: String::new(),
            table_id: TableId(0),
            finished_ts: Ts::new(300),
            table_info: None,
            query: "DROP DATABASE test".into(),
            ..create_job(3, 0, "", 300)
        };
        let mut diff = snap.apply(&drop).unwrap();
        diff.dropped.sort();
        assert_eq!(diff.dropped, vec![TableId(10), TableId(11)]);
        assert!(snap.table_ids().is_empty());
    }

    #[test]
    fn test_ineligible_tracking_follows_alter() {
        let mut snap = SchemaSnapshot::new();
        let mut job = create_job(1, 10, "t", 100);
        job.table_info = Some(table_info(10, "test", "t", false));
        snap.apply(&job).unwrap();
        assert!(snap.is_ineligible_table_id(TableId(10)));

        // Adding a primary key makes the table eligible again.
        let alter = DdlJob {
            action: DdlAction::AddIndex,
            finished_ts: Ts::new(200),
            table_info: Some(table_info(10, "test", "t", true)),
            ..create_job(2, 10, "t", 200)
        };
        snap.apply(&alter).unwrap();
        assert!(!snap.is_ineligible_table_id(TableId(10)));
    }
}

//! Schema change (DDL) jobs and table metadata.

use serde::{Deserialize, Serialize};

use super::{TableId, Ts};

/// What a DDL job does to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DdlAction {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
}

impl DdlAction {
    /// Whether this action changes the set of physical table ids a
    /// changefeed must replicate.
    pub fn changes_table_set(self) -> bool {
        matches!(
            self,
            DdlAction::CreateTable
                | DdlAction::DropTable
                | DdlAction::TruncateTable
                | DdlAction::DropSchema
        )
    }
}

/// Column type as reported by the upstream schema library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    UInt,
    Float,
    Varchar,
    Blob,
    Bool,
    Timestamp,
}

/// Column metadata inside a [`TableInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    /// Generated columns are never written downstream.
    #[serde(default)]
    pub generated: bool,
    /// Columns still going through an online schema change are non-public
    /// and are never written downstream.
    #[serde(default = "default_true")]
    pub public: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

/// Table metadata valid at one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    #[serde(rename = "schema-name")]
    pub schema_name: String,
    #[serde(rename = "table-name")]
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    /// Name of the integer primary-key column that doubles as the row
    /// handle, when the table has one.
    #[serde(rename = "pk-handle")]
    pub pk_handle: Option<String>,
}

impl TableInfo {
    /// Columns that may be written downstream: public and not generated.
    pub fn writable_columns(&self) -> Vec<&ColumnInfo> {
        self.columns
            .iter()
            .filter(|c| c.public && !c.generated)
            .collect()
    }

    /// Columns forming the replication key, preferring the primary key.
    pub fn unique_key_columns(&self) -> Vec<&ColumnInfo> {
        let pks: Vec<_> = self.columns.iter().filter(|c| c.primary_key).collect();
        if !pks.is_empty() {
            return pks;
        }
        self.columns
            .iter()
            .filter(|c| c.unique && !c.nullable)
            .collect()
    }

    /// A table without a usable unique key cannot be replicated row-wise.
    pub fn has_usable_unique_key(&self) -> bool {
        !self.unique_key_columns().is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A finished DDL job pulled from the upstream schema change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlJob {
    pub id: i64,
    #[serde(rename = "schema-name")]
    pub schema_name: String,
    #[serde(rename = "table-name")]
    pub table_name: String,
    #[serde(rename = "table-id")]
    pub table_id: TableId,
    pub action: DdlAction,
    pub query: String,
    #[serde(rename = "finished-ts")]
    pub finished_ts: Ts,
    /// The table definition after the job, for actions that (re)define one.
    #[serde(rename = "table-info", default, skip_serializing_if = "Option::is_none")]
    pub table_info: Option<TableInfo>,
    /// Truncate assigns the table a fresh physical id.
    #[serde(rename = "new-table-id", default, skip_serializing_if = "Option::is_none")]
    pub new_table_id: Option<TableId>,
}

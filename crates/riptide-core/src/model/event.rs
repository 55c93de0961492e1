//! Decoded, schema-aware change events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ddl::{DdlAction, DdlJob};
use super::Ts;

/// A single decoded column value.
///
/// Values are kept in their upstream-typed form until a sink renders them,
/// either as SQL parameters or as JSON in the message-bus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

/// Kind of a row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

impl RowKind {
    /// Wire code used by the message-bus payload.
    pub fn code(self) -> u32 {
        match self {
            RowKind::Insert => 0,
            RowKind::Update => 1,
            RowKind::Delete => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(RowKind::Insert),
            1 => Some(RowKind::Update),
            2 => Some(RowKind::Delete),
            _ => None,
        }
    }
}

/// A decoded row change, ready for a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangedEvent {
    pub schema: String,
    pub table: String,
    pub kind: RowKind,
    #[serde(rename = "commit-ts")]
    pub commit_ts: Ts,
    /// Column name to value. For deletes only the unique-key columns are
    /// populated.
    pub columns: BTreeMap<String, ColumnValue>,
}

/// A decoded schema change, ready for a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DDLEvent {
    pub schema: String,
    pub table: String,
    pub query: String,
    pub action: DdlAction,
    #[serde(rename = "finished-ts")]
    pub finished_ts: Ts,
    pub job: DdlJob,
}

impl DDLEvent {
    pub fn from_job(job: DdlJob) -> Self {
        Self {
            schema: job.schema_name.clone(),
            table: job.table_name.clone(),
            query: job.query.clone(),
            action: job.action,
            finished_ts: job.finished_ts,
            job,
        }
    }
}

/// A mounted transaction: every DML shares `commit_ts`.
///
/// A transaction carries either DMLs or a single DDL, never both.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Txn {
    pub commit_ts: Ts,
    pub dmls: Vec<RowChangedEvent>,
    pub ddl: Option<DDLEvent>,
}

impl Txn {
    pub fn is_ddl(&self) -> bool {
        self.ddl.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.dmls.is_empty() && self.ddl.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_value_json_roundtrip() {
        for v in [
            ColumnValue::Null,
            ColumnValue::Bool(true),
            ColumnValue::Int(-7),
            ColumnValue::UInt(u64::MAX),
            ColumnValue::Float(1.5),
            ColumnValue::String("x".into()),
            ColumnValue::Bytes(vec![0, 255]),
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: ColumnValue = serde_json::from_str(&json).unwrap();
            assert_eq!(v, back, "roundtrip of {json}");
        }
    }

    #[test]
    fn test_row_kind_codes() {
        for kind in [RowKind::Insert, RowKind::Update, RowKind::Delete] {
            assert_eq!(RowKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RowKind::from_code(9), None);
    }
}

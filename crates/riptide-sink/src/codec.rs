//! Message-bus wire format.
//!
//! Every message is a framed binary envelope followed by a payload:
//!
//! ```text
//! envelope: magic:u32 | version:u8 | kind:u8 | cdc-id:varstr
//! resolved: commit-ts:i64
//! txn:      commit-ts:u64 | op:u8 | body-len:u32 | body | crc32c(body):u32
//! ```
//!
//! All integers are big-endian. `varstr` is a LEB128 uvarint length
//! followed by the UTF-8 bytes. The checksum is CRC32C (Castagnoli) over
//! the body and is validated on decode.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use riptide_core::model::{
    ColumnInfo, ColumnValue, DDLEvent, DdlJob, RowChangedEvent, RowKind, Ts,
};
use riptide_schema::SchemaInfoGetter;

use crate::error::{Result, SinkError};

/// Leading magic of every message.
pub const MAGIC: u32 = 0xBAAA_D700;
/// Current envelope version.
pub const VERSION: u8 = 1;

const KIND_RESOLVED: u8 = 1;
const KIND_TXN: u8 = 2;

const OP_DML: u8 = 1;
const OP_DDL: u8 = 2;

/// One DML inside a decoded transaction message.
#[derive(Debug, Clone, PartialEq)]
pub struct MqDml {
    pub schema: String,
    pub table: String,
    pub kind: RowKind,
    pub values: BTreeMap<String, ColumnValue>,
    pub columns: Vec<ColumnInfo>,
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Resolved {
        cdc_id: String,
        ts: Ts,
    },
    Dml {
        cdc_id: String,
        commit_ts: Ts,
        dmls: Vec<MqDml>,
    },
    Ddl {
        cdc_id: String,
        commit_ts: Ts,
        schema: String,
        table: String,
        job: DdlJob,
    },
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_uvarint(buf: &mut Bytes) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(SinkError::Codec("truncated uvarint".into()));
        }
        let byte = buf.get_u8();
        if shift >= 64 {
            return Err(SinkError::Codec("uvarint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn put_varstr(buf: &mut BytesMut, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn get_varstr(buf: &mut Bytes) -> Result<String> {
    let len = get_uvarint(buf)? as usize;
    if buf.remaining() < len {
        return Err(SinkError::Codec("truncated varstr".into()));
    }
    String::from_utf8(buf.split_to(len).to_vec())
        .map_err(|e| SinkError::Codec(e.to_string()))
}

fn put_envelope(buf: &mut BytesMut, kind: u8, cdc_id: &str) {
    buf.put_u32(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(kind);
    put_varstr(buf, cdc_id);
}

/// Encode a resolved-ts message.
pub fn encode_resolved(cdc_id: &str, ts: Ts) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + cdc_id.len());
    put_envelope(&mut buf, KIND_RESOLVED, cdc_id);
    buf.put_i64(ts.0 as i64);
    buf.freeze()
}

/// Encode a DML transaction message. Column metadata for each DML's table
/// is resolved through the schema snapshot and embedded for readers.
pub fn encode_dml_txn(
    cdc_id: &str,
    commit_ts: Ts,
    rows: &[RowChangedEvent],
    info: &dyn SchemaInfoGetter,
) -> Result<Bytes> {
    let mut body = BytesMut::new();
    body.put_u32(rows.len() as u32);
    for row in rows {
        put_varstr(&mut body, &row.schema);
        put_varstr(&mut body, &row.table);
        body.put_u32(row.kind.code());

        body.put_u32(row.columns.len() as u32);
        for (name, value) in &row.columns {
            put_varstr(&mut body, name);
            let json = serde_json::to_string(value).map_err(|e| SinkError::Codec(e.to_string()))?;
            put_varstr(&mut body, &json);
        }

        let table_id = info
            .table_id_by_name(&row.schema, &row.table)
            .ok_or_else(|| SinkError::SchemaLookup(row.schema.clone(), row.table.clone()))?;
        let table = info
            .table_by_id(table_id)
            .ok_or_else(|| SinkError::SchemaLookup(row.schema.clone(), row.table.clone()))?;
        let columns = table.writable_columns();
        body.put_u32(columns.len() as u32);
        for col in columns {
            let json = serde_json::to_string(col).map_err(|e| SinkError::Codec(e.to_string()))?;
            put_varstr(&mut body, &json);
        }
    }
    Ok(seal_txn(cdc_id, commit_ts, OP_DML, &body))
}

/// Encode a DDL transaction message.
pub fn encode_ddl_txn(cdc_id: &str, ddl: &DDLEvent) -> Result<Bytes> {
    let mut body = BytesMut::new();
    put_varstr(&mut body, &ddl.schema);
    put_varstr(&mut body, &ddl.table);
    let json = serde_json::to_string(&ddl.job).map_err(|e| SinkError::Codec(e.to_string()))?;
    put_varstr(&mut body, &json);
    Ok(seal_txn(cdc_id, ddl.finished_ts, OP_DDL, &body))
}

fn seal_txn(cdc_id: &str, commit_ts: Ts, op: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + cdc_id.len() + body.len());
    put_envelope(&mut buf, KIND_TXN, cdc_id);
    buf.put_u64(commit_ts.0);
    buf.put_u8(op);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.put_u32(crc32c::crc32c(body));
    buf.freeze()
}

/// Decode one message, validating magic, version and checksum.
pub fn decode(data: &[u8]) -> Result<Message> {
    let mut buf = Bytes::copy_from_slice(data);
    if buf.remaining() < 6 {
        return Err(SinkError::Codec("truncated envelope".into()));
    }
    if buf.get_u32() != MAGIC {
        return Err(SinkError::Codec("invalid magic".into()));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(SinkError::Codec(format!("unsupported version {version}")));
    }
    let kind = buf.get_u8();
    let cdc_id = get_varstr(&mut buf)?;

    match kind {
        KIND_RESOLVED => {
            if buf.remaining() < 8 {
                return Err(SinkError::Codec("truncated resolved payload".into()));
            }
            let ts = buf.get_i64();
            Ok(Message::Resolved {
                cdc_id,
                ts: Ts::new(ts as u64),
            })
        }
        KIND_TXN => decode_txn(cdc_id, &mut buf),
        other => Err(SinkError::Codec(format!("unsupported kind {other}"))),
    }
}

fn decode_txn(cdc_id: String, buf: &mut Bytes) -> Result<Message> {
    if buf.remaining() < 13 {
        return Err(SinkError::Codec("truncated txn header".into()));
    }
    let commit_ts = Ts::new(buf.get_u64());
    let op = buf.get_u8();
    let body_len = buf.get_u32() as usize;
    if buf.remaining() < body_len + 4 {
        return Err(SinkError::Codec("truncated txn body".into()));
    }
    let body = buf.split_to(body_len);
    let expected_crc = buf.get_u32();
    let actual_crc = crc32c::crc32c(&body);
    if expected_crc != actual_crc {
        return Err(SinkError::Codec(format!(
            "crc mismatch: expected {expected_crc:#x}, computed {actual_crc:#x}"
        )));
    }

    let mut body = body;
    match op {
        OP_DML => {
            let n = {
                if body.remaining() < 4 {
                    return Err(SinkError::Codec("truncated dml count".into()));
                }
                body.get_u32() as usize
            };
            let mut dmls = Vec::with_capacity(n);
            for _ in 0..n {
                let schema = get_varstr(&mut body)?;
                let table = get_varstr(&mut body)?;
                if body.remaining() < 4 {
                    return Err(SinkError::Codec("truncated dml kind".into()));
                }
                let kind = RowKind::from_code(body.get_u32())
                    .ok_or_else(|| SinkError::Codec("unknown dml kind".into()))?;

                if body.remaining() < 4 {
                    return Err(SinkError::Codec("truncated value count".into()));
                }
                let n_values = body.get_u32() as usize;
                let mut values = BTreeMap::new();
                for _ in 0..n_values {
                    let name = get_varstr(&mut body)?;
                    let json = get_varstr(&mut body)?;
                    let value: ColumnValue = serde_json::from_str(&json)
                        .map_err(|e| SinkError::Codec(e.to_string()))?;
                    values.insert(name, value);
                }

                if body.remaining() < 4 {
                    return Err(SinkError::Codec("truncated column count".into()));
                }
                let n_cols = body.get_u32() as usize;
                let mut columns = Vec::with_capacity(n_cols);
                for _ in 0..n_cols {
                    let json = get_varstr(&mut body)?;
                    let col: ColumnInfo = serde_json::from_str(&json)
                        .map_err(|e| SinkError::Codec(e.to_string()))?;
                    columns.push(col);
                }

                dmls.push(MqDml {
                    schema,
                    table,
                    kind,
                    values,
                    columns,
                });
            }
            Ok(Message::Dml {
                cdc_id,
                commit_ts,
                dmls,
            })
        }
        OP_DDL => {
            let schema = get_varstr(&mut body)?;
            let table = get_varstr(&mut body)?;
            let json = get_varstr(&mut body)?;
            let job: DdlJob =
                serde_json::from_str(&json).map_err(|e| SinkError::Codec(e.to_string()))?;
            Ok(Message::Ddl {
                cdc_id,
                commit_ts,
                schema,
                table,
                job,
            })
        }
        other => Err(SinkError::Codec(format!("unsupported txn op {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::model::{ColumnType, DdlAction, TableId, TableInfo};
    use riptide_schema::SchemaSnapshot;

    fn snapshot() -> SchemaSnapshot {
        let info = TableInfo {
            id: TableId(10),
            schema_name: "test".into(),
            table_name: "t".into(),
            columns: vec![
                ColumnInfo {
                    id: 1,
                    name: "id".into(),
                    col_type: ColumnType::Int,
                    primary_key: true,
                    unique: true,
                    generated: false,
                    public: true,
                    nullable: false,
                },
                ColumnInfo {
                    id: 2,
                    name: "name".into(),
                    col_type: ColumnType::Varchar,
                    primary_key: false,
                    unique: false,
                    generated: false,
                    public: true,
                    nullable: true,
                },
            ],
            pk_handle: Some("id".into()),
        };
        SchemaSnapshot::with_tables(vec![info], Ts::new(1))
    }

    fn row() -> RowChangedEvent {
        let mut columns = BTreeMap::new();
        columns.insert("id".to_string(), ColumnValue::Int(7));
        columns.insert("name".to_string(), ColumnValue::String("x".into()));
        RowChangedEvent {
            schema: "test".into(),
            table: "t".into(),
            kind: RowKind::Insert,
            commit_ts: Ts::new(5000),
            columns,
        }
    }

    #[test]
    fn test_resolved_roundtrip() {
        let encoded = encode_resolved("cdc-1", Ts::new(4242));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(
            decoded,
            Message::Resolved {
                cdc_id: "cdc-1".into(),
                ts: Ts::new(4242)
            }
        );
    }

    #[test]
    fn test_dml_roundtrip() {
        let snap = snapshot();
        let encoded = encode_dml_txn("cdc-1", Ts::new(5000), &[row()], &snap).unwrap();
        match decode(&encoded).unwrap() {
            Message::Dml {
                cdc_id,
                commit_ts,
                dmls,
            } => {
                assert_eq!(cdc_id, "cdc-1");
                assert_eq!(commit_ts, Ts::new(5000));
                assert_eq!(dmls.len(), 1);
                let dml = &dmls[0];
                assert_eq!(dml.schema, "test");
                assert_eq!(dml.table, "t");
                assert_eq!(dml.kind, RowKind::Insert);
                assert_eq!(dml.values["id"], ColumnValue::Int(7));
                assert_eq!(dml.values["name"], ColumnValue::String("x".into()));
                assert_eq!(dml.columns.len(), 2);
                assert_eq!(dml.columns[0].name, "id");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_ddl_roundtrip() {
        let job = DdlJob {
            id: 3,
            schema_name: "test".into(),
            table_name: "t".into(),
            table_id: TableId(10),
            action: DdlAction::AddColumn,
            query: "ALTER TABLE test.t ADD name varchar(20)".into(),
            finished_ts: Ts::new(1200),
            table_info: None,
            new_table_id: None,
        };
        let ddl = DDLEvent::from_job(job.clone());
        let encoded = encode_ddl_txn("cdc-1", &ddl).unwrap();
        match decode(&encoded).unwrap() {
            Message::Ddl {
                commit_ts,
                schema,
                table,
                job: decoded_job,
                ..
            } => {
                assert_eq!(commit_ts, Ts::new(1200));
                assert_eq!(schema, "test");
                assert_eq!(table, "t");
                assert_eq!(decoded_job, job);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_crc_validation() {
        let snap = snapshot();
        let encoded = encode_dml_txn("cdc-1", Ts::new(5000), &[row()], &snap).unwrap();
        let mut corrupted = encoded.to_vec();
        // Flip one bit inside the body.
        let idx = corrupted.len() - 8;
        corrupted[idx] ^= 0x01;
        let err = decode(&corrupted).unwrap_err();
        assert!(matches!(err, SinkError::Codec(msg) if msg.contains("crc")));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = encode_resolved("cdc-1", Ts::new(1)).to_vec();
        encoded[0] = 0;
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_uvarint_roundtrip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_uvarint(&mut buf, v);
            let mut bytes = buf.freeze();
            assert_eq!(get_uvarint(&mut bytes).unwrap(), v);
        }
    }
}

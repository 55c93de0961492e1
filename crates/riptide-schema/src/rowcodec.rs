//! Upstream row format.
//!
//! Row keys are `t | table_id:be64 | _r | handle:be64`; row values carry a
//! big-endian column count followed by name/value pairs. Integers are
//! big-endian throughout. The encode half exists for tests and synthetic
//! upstreams; production entries arrive already encoded.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use riptide_core::model::{ColumnValue, TableId};

use crate::error::{Result, SchemaError};

const ROW_KEY_PREFIX: u8 = b't';
const ROW_KEY_SEP: &[u8] = b"_r";

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_UINT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BOOL: u8 = 6;

/// Encode the key of a row addressed by its integer handle.
pub fn encode_row_key(table_id: TableId, handle: i64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(19);
    buf.put_u8(ROW_KEY_PREFIX);
    buf.put_i64(table_id.0);
    buf.put_slice(ROW_KEY_SEP);
    buf.put_i64(handle);
    buf.to_vec()
}

/// Decode a row key into its table id and handle.
pub fn decode_row_key(key: &[u8]) -> Result<(TableId, i64)> {
    if key.len() != 19 || key[0] != ROW_KEY_PREFIX || &key[9..11] != ROW_KEY_SEP {
        return Err(SchemaError::Decode(format!(
            "malformed row key ({} bytes)",
            key.len()
        )));
    }
    let mut buf = &key[1..9];
    let table_id = buf.get_i64();
    let mut buf = &key[11..19];
    let handle = buf.get_i64();
    Ok((TableId(table_id), handle))
}

/// Encode a row value from its column map.
pub fn encode_row_value(columns: &BTreeMap<String, ColumnValue>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(columns.len() as u32);
    for (name, value) in columns {
        buf.put_u16(name.len() as u16);
        buf.put_slice(name.as_bytes());
        match value {
            ColumnValue::Null => buf.put_u8(TAG_NULL),
            ColumnValue::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*v);
            }
            ColumnValue::UInt(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u64(*v);
            }
            ColumnValue::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*v);
            }
            ColumnValue::Bytes(v) => {
                buf.put_u8(TAG_BYTES);
                buf.put_u32(v.len() as u32);
                buf.put_slice(v);
            }
            ColumnValue::String(v) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            ColumnValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*v));
            }
        }
    }
    buf.to_vec()
}

/// Decode a row value into its column map.
pub fn decode_row_value(value: &[u8]) -> Result<BTreeMap<String, ColumnValue>> {
    let mut buf = Bytes::copy_from_slice(value);
    let mut columns = BTreeMap::new();
    if buf.remaining() < 4 {
        return Err(SchemaError::Decode("truncated row value".into()));
    }
    let count = buf.get_u32();
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(SchemaError::Decode("truncated column name length".into()));
        }
        let name_len = buf.get_u16() as usize;
        if buf.remaining() < name_len + 1 {
            return Err(SchemaError::Decode("truncated column name".into()));
        }
        let name = String::from_utf8(buf.split_to(name_len).to_vec())
            .map_err(|e| SchemaError::Decode(e.to_string()))?;
        let tag = buf.get_u8();
        let value = match tag {
            TAG_NULL => ColumnValue::Null,
            TAG_INT => {
                ensure(&buf, 8)?;
                ColumnValue::Int(buf.get_i64())
            }
            TAG_UINT => {
                ensure(&buf, 8)?;
                ColumnValue::UInt(buf.get_u64())
            }
            TAG_FLOAT => {
                ensure(&buf, 8)?;
                ColumnValue::Float(buf.get_f64())
            }
            TAG_BYTES => {
                ensure(&buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure(&buf, len)?;
                ColumnValue::Bytes(buf.split_to(len).to_vec())
            }
            TAG_STRING => {
                ensure(&buf, 4)?;
                let len = buf.get_u32() as usize;
                ensure(&buf, len)?;
                ColumnValue::String(
                    String::from_utf8(buf.split_to(len).to_vec())
                        .map_err(|e| SchemaError::Decode(e.to_string()))?,
                )
            }
            TAG_BOOL => {
                ensure(&buf, 1)?;
                ColumnValue::Bool(buf.get_u8() != 0)
            }
            other => {
                return Err(SchemaError::Decode(format!("unknown column tag {other}")));
            }
        };
        columns.insert(name, value);
    }
    Ok(columns)
}

fn ensure(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(SchemaError::Decode("truncated column value".into()));
    }
    Ok(())
}

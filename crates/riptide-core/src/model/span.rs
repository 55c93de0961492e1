//! Key spans over the upstream key space.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)` over the upstream key space.
///
/// Spans derived from different tables never overlap: every table's rows
/// live under a dedicated prefix, and schema (DDL) records live under a
/// separate prefix of their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    #[serde(with = "hex_bytes")]
    pub start: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end: Vec<u8>,
}

/// Prefix under which table row records are stored.
const ROW_PREFIX: u8 = b't';
/// Prefix under which schema change (DDL) records are stored.
const DDL_PREFIX: u8 = b'm';

impl Span {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The span covering all row records of one table.
    pub fn table_span(table_id: i64) -> Self {
        let mut start = BytesMut::with_capacity(10);
        start.put_u8(ROW_PREFIX);
        start.put_i64(table_id);
        let mut end = BytesMut::with_capacity(10);
        end.put_u8(ROW_PREFIX);
        end.put_i64(table_id + 1);
        Self {
            start: start.to_vec(),
            end: end.to_vec(),
        }
    }

    /// The span covering all schema change records.
    pub fn ddl_span() -> Self {
        Self {
            start: vec![DDL_PREFIX],
            end: vec![DDL_PREFIX + 1],
        }
    }

    /// Whether `key` falls inside this half-open range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && key < self.end.as_slice()
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", hex(&self.start), hex(&self.end))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serialize spans as lowercase hex so they survive JSON round-trips through
/// the metadata store without escaping issues.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex string"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16)
                    .map_err(|e| serde::de::Error::custom(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_spans_do_not_overlap() {
        let a = Span::table_span(41);
        let b = Span::table_span(42);
        assert_eq!(a.end, b.start);
        assert!(!a.contains(&b.start));
        assert!(b.contains(&b.start));
    }

    #[test]
    fn test_ddl_span_disjoint_from_rows() {
        let ddl = Span::ddl_span();
        let rows = Span::table_span(1);
        assert!(!ddl.contains(&rows.start));
        assert!(!rows.contains(&ddl.start));
    }

    #[test]
    fn test_contains_half_open() {
        let span = Span::new(vec![1u8], vec![3u8]);
        assert!(span.contains(&[1]));
        assert!(span.contains(&[2, 200]));
        assert!(!span.contains(&[3]));
        assert!(!span.contains(&[0]));
    }

    #[test]
    fn test_json_roundtrip() {
        let span = Span::table_span(7);
        let json = serde_json::to_string(&span).unwrap();
        let back: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(span, back);
    }
}

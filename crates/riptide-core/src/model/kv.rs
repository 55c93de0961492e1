//! Raw KV change entries and raw transactions.

use serde::{Deserialize, Serialize};

use super::Ts;

/// Identifier of an upstream storage region.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RegionId(pub u64);

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation carried by a raw KV entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Put,
    Delete,
    /// Carries only a timestamp: no entry with `commit_ts <= ts` will appear
    /// later on the same stream.
    Resolved,
}

/// A raw change entry as delivered by the upstream region streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawKVEntry {
    #[serde(rename = "op-type")]
    pub op_type: OpType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    #[serde(rename = "start-ts")]
    pub start_ts: Ts,
    #[serde(rename = "commit-ts")]
    pub commit_ts: Ts,
}

impl RawKVEntry {
    pub fn put(key: Vec<u8>, value: Vec<u8>, start_ts: Ts, commit_ts: Ts) -> Self {
        Self {
            op_type: OpType::Put,
            key,
            value,
            start_ts,
            commit_ts,
        }
    }

    pub fn delete(key: Vec<u8>, start_ts: Ts, commit_ts: Ts) -> Self {
        Self {
            op_type: OpType::Delete,
            key,
            value: Vec::new(),
            start_ts,
            commit_ts,
        }
    }

    pub fn resolved(ts: Ts) -> Self {
        Self {
            op_type: OpType::Resolved,
            key: Vec::new(),
            value: Vec::new(),
            start_ts: Ts::ZERO,
            commit_ts: ts,
        }
    }
}

/// An ordered group of Put/Delete entries sharing one commit timestamp.
///
/// A `RawTxn` with no entries is a resolved tick: everything at or below
/// `commit_ts` has been delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTxn {
    pub commit_ts: Ts,
    pub entries: Vec<RawKVEntry>,
}

impl RawTxn {
    /// Build a transaction from entries that must all share `commit_ts`.
    pub fn new(commit_ts: Ts, entries: Vec<RawKVEntry>) -> Self {
        debug_assert!(entries.iter().all(|e| e.commit_ts == commit_ts));
        Self { commit_ts, entries }
    }

    /// A resolved tick carrying no data.
    pub fn resolved(ts: Ts) -> Self {
        Self {
            commit_ts: ts,
            entries: Vec::new(),
        }
    }

    pub fn is_resolved_tick(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_entry_shape() {
        let e = RawKVEntry::resolved(Ts::new(99));
        assert_eq!(e.op_type, OpType::Resolved);
        assert_eq!(e.commit_ts, Ts::new(99));
        assert!(e.key.is_empty() && e.value.is_empty());
    }

    #[test]
    fn test_raw_txn_resolved_tick() {
        let txn = RawTxn::resolved(Ts::new(7));
        assert!(txn.is_resolved_tick());
        let txn = RawTxn::new(
            Ts::new(7),
            vec![RawKVEntry::put(vec![1], vec![2], Ts::new(5), Ts::new(7))],
        );
        assert!(!txn.is_resolved_tick());
    }
}

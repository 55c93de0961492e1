//! Commit-ts ordering of buffered entries.

use riptide_core::model::{RawKVEntry, RawTxn, Ts};
use tracing::warn;

/// Buffers raw entries until a resolved tick, then releases everything at
/// or below the tick as raw transactions in non-decreasing commit-ts
/// order. Ties inside a transaction break by (key, start-ts).
#[derive(Debug, Default)]
pub struct Sorter {
    pending: Vec<RawKVEntry>,
    resolved_ts: Ts,
}

impl Sorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one entry. An entry at or below the last resolved tick
    /// violates the upstream contract and is dropped.
    pub fn push(&mut self, entry: RawKVEntry) {
        if entry.commit_ts <= self.resolved_ts && !self.resolved_ts.is_zero() {
            warn!(
                commit_ts = %entry.commit_ts,
                resolved_ts = %self.resolved_ts,
                "dropping entry below resolved-ts"
            );
            return;
        }
        self.pending.push(entry);
    }

    /// Apply a resolved tick: release every buffered entry with
    /// `commit_ts <= ts`, grouped by commit-ts into transactions.
    pub fn resolve(&mut self, ts: Ts) -> Vec<RawTxn> {
        if ts < self.resolved_ts {
            warn!(%ts, resolved_ts = %self.resolved_ts, "ignoring resolved-ts regression");
            return Vec::new();
        }
        self.resolved_ts = ts;

        let mut ready: Vec<RawKVEntry> = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if entry.commit_ts <= ts {
                ready.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.pending = remaining;

        ready.sort_by(|a, b| {
            a.commit_ts
                .cmp(&b.commit_ts)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.start_ts.cmp(&b.start_ts))
        });

        let mut txns: Vec<RawTxn> = Vec::new();
        for entry in ready {
            match txns.last_mut() {
                Some(txn) if txn.commit_ts == entry.commit_ts => txn.entries.push(entry),
                _ => txns.push(RawTxn::new(entry.commit_ts, vec![entry])),
            }
        }
        txns
    }

    /// Entries still waiting for a resolved tick.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

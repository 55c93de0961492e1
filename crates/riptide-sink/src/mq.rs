//! Message-bus sink.
//!
//! Transactions are framed with the codec in [`crate::codec`] and sent to
//! a partition chosen by table, so one table's changes stay ordered within
//! a partition. Resolved timestamps are broadcast to every partition so
//! readers can release buffered transactions.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use riptide_core::model::{DDLEvent, RowChangedEvent, Ts};
use riptide_schema::SchemaInfoGetter;
use tracing::debug;

use crate::codec;
use crate::error::{Result, SinkError};
use crate::sink::Sink;

/// The message-bus client contract; an external collaborator.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Durably append one message to a partition. Returning `Ok` means the
    /// bus acknowledged the write.
    async fn send(&self, partition: i32, key: Bytes, value: Bytes) -> Result<()>;

    fn partitions(&self) -> i32;
}

pub struct MqSink {
    bus: Arc<dyn MessageBus>,
    cdc_id: String,
    schema: Arc<dyn SchemaInfoGetter>,
    max_message_bytes: usize,
    checkpoint: AtomicU64,
}

impl MqSink {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        cdc_id: String,
        schema: Arc<dyn SchemaInfoGetter>,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            bus,
            cdc_id,
            schema,
            max_message_bytes,
            checkpoint: AtomicU64::new(0),
        }
    }

    fn partition_for(&self, schema: &str, table: &str) -> i32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        schema.hash(&mut hasher);
        table.hash(&mut hasher);
        (hasher.finish() % self.bus.partitions() as u64) as i32
    }

    async fn send_txn(&self, partition: i32, commit_ts: Ts, payload: Bytes) -> Result<()> {
        if payload.len() > self.max_message_bytes {
            return Err(SinkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_bytes,
            });
        }
        let key = Bytes::copy_from_slice(&commit_ts.0.to_be_bytes());
        self.bus.send(partition, key, payload).await
    }

    fn advance_checkpoint(&self, ts: Ts) {
        let mut current = self.checkpoint.load(Ordering::Acquire);
        while ts.0 > current {
            match self.checkpoint.compare_exchange_weak(
                current,
                ts.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

#[async_trait]
impl Sink for MqSink {
    async fn emit_row_changed_events(&self, rows: &[RowChangedEvent]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // Group by commit-ts, then by partition so per-partition messages
        // stay in commit-ts order.
        let mut groups: BTreeMap<Ts, BTreeMap<i32, Vec<RowChangedEvent>>> = BTreeMap::new();
        for row in rows {
            let partition = self.partition_for(&row.schema, &row.table);
            groups
                .entry(row.commit_ts)
                .or_default()
                .entry(partition)
                .or_default()
                .push(row.clone());
        }

        for (commit_ts, partitions) in groups {
            for (partition, rows) in partitions {
                let payload =
                    codec::encode_dml_txn(&self.cdc_id, commit_ts, &rows, self.schema.as_ref())?;
                if payload.len() <= self.max_message_bytes || rows.len() == 1 {
                    self.send_txn(partition, commit_ts, payload).await?;
                    continue;
                }
                // Oversized group: fall back to one message per row.
                debug!(%commit_ts, size = payload.len(), "splitting oversized transaction");
                for row in &rows {
                    let payload = codec::encode_dml_txn(
                        &self.cdc_id,
                        commit_ts,
                        std::slice::from_ref(row),
                        self.schema.as_ref(),
                    )?;
                    self.send_txn(partition, commit_ts, payload).await?;
                }
            }
            self.advance_checkpoint(commit_ts);
        }
        Ok(())
    }

    async fn emit_ddl_event(&self, ddl: &DDLEvent) -> Result<()> {
        let payload = codec::encode_ddl_txn(&self.cdc_id, ddl)?;
        // DDL goes to every partition: each partition's readers need the
        // schema change before the rows that depend on it.
        for partition in 0..self.bus.partitions() {
            self.send_txn(partition, ddl.finished_ts, payload.clone())
                .await?;
        }
        Ok(())
    }

    async fn emit_checkpoint_event(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    async fn emit_resolved_event(&self, ts: Ts) -> Result<()> {
        let payload = codec::encode_resolved(&self.cdc_id, ts);
        for partition in 0..self.bus.partitions() {
            let key = Bytes::copy_from_slice(&ts.0.to_be_bytes());
            self.bus.send(partition, key, payload.clone()).await?;
        }
        self.advance_checkpoint(ts);
        Ok(())
    }

    fn checkpoint_ts(&self) -> Ts {
        Ts::new(self.checkpoint.load(Ordering::Acquire))
    }
}

/// In-memory message bus for tests and standalone deployments.
pub struct MemMessageBus {
    partitions: Vec<Mutex<Vec<(Bytes, Bytes)>>>,
}

impl MemMessageBus {
    pub fn new(partitions: i32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Messages appended to one partition, in order.
    pub fn messages(&self, partition: i32) -> Vec<(Bytes, Bytes)> {
        self.partitions[partition as usize].lock().clone()
    }

    pub fn total_messages(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }
}

#[async_trait]
impl MessageBus for MemMessageBus {
    async fn send(&self, partition: i32, key: Bytes, value: Bytes) -> Result<()> {
        let slot = self
            .partitions
            .get(partition as usize)
            .ok_or_else(|| SinkError::Bus(format!("unknown partition {partition}")))?;
        slot.lock().push((key, value));
        Ok(())
    }

    fn partitions(&self) -> i32 {
        self.partitions.len() as i32
    }
}

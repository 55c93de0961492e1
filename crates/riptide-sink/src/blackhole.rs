//! A sink that swallows everything, for tests and load measurement.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use riptide_core::model::{DDLEvent, RowChangedEvent, Ts};
use tracing::debug;

use crate::error::Result;
use crate::sink::Sink;

/// Discards events while tracking counts and the checkpoint, and records
/// what it saw so tests can assert on emission order.
#[derive(Default)]
pub struct BlackholeSink {
    checkpoint: AtomicU64,
    row_count: AtomicU64,
    ddl_count: AtomicU64,
    rows: Mutex<Vec<RowChangedEvent>>,
    ddls: Mutex<Vec<DDLEvent>>,
}

impl BlackholeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }

    pub fn ddl_count(&self) -> u64 {
        self.ddl_count.load(Ordering::Relaxed)
    }

    /// Every row emitted so far, in emission order.
    pub fn rows(&self) -> Vec<RowChangedEvent> {
        self.rows.lock().clone()
    }

    pub fn ddls(&self) -> Vec<DDLEvent> {
        self.ddls.lock().clone()
    }
}

#[async_trait]
impl Sink for BlackholeSink {
    async fn emit_row_changed_events(&self, rows: &[RowChangedEvent]) -> Result<()> {
        self.row_count.fetch_add(rows.len() as u64, Ordering::Relaxed);
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }

    async fn emit_ddl_event(&self, ddl: &DDLEvent) -> Result<()> {
        debug!(query = %ddl.query, "blackhole ddl");
        self.ddl_count.fetch_add(1, Ordering::Relaxed);
        self.ddls.lock().push(ddl.clone());
        Ok(())
    }

    async fn emit_checkpoint_event(&self, _ts: Ts) -> Result<()> {
        Ok(())
    }

    async fn emit_resolved_event(&self, ts: Ts) -> Result<()> {
        // Everything below the resolved-ts has been "applied" the moment
        // it was swallowed.
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
        Ok(())
    }

    fn checkpoint_ts(&self) -> Ts {
        Ts::new(self.checkpoint.load(Ordering::Acquire))
    }
}

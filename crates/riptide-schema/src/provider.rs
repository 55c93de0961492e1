//! Bootstrap snapshots from the upstream schema-info library.

use async_trait::async_trait;
use parking_lot::RwLock;
use riptide_core::model::Ts;

use crate::error::Result;
use crate::snapshot::SchemaSnapshot;

/// Produces the schema state valid at a timestamp.
///
/// An external collaborator: production deployments back this with the
/// upstream's schema-info library (full DDL history replay). Controllers
/// seed their snapshots from it and advance them with live DDL jobs.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot_at(&self, ts: Ts) -> Result<SchemaSnapshot>;
}

/// Serves clones of one snapshot, for tests and synthetic deployments.
pub struct FixedSnapshotProvider {
    snapshot: RwLock<SchemaSnapshot>,
}

impl FixedSnapshotProvider {
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: SchemaSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

#[async_trait]
impl SnapshotProvider for FixedSnapshotProvider {
    async fn snapshot_at(&self, _ts: Ts) -> Result<SchemaSnapshot> {
        Ok(self.snapshot.read().clone())
    }
}

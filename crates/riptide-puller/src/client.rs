//! The upstream region event client contract.

use async_trait::async_trait;
use riptide_core::model::{RawKVEntry, RegionId, Span, Ts};
use tokio::sync::mpsc;

use crate::error::Result;

/// One event on a region-change subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionFeedEvent {
    /// A raw Put/Delete entry from one region.
    Entry { region: RegionId, entry: RawKVEntry },
    /// No further entries with `commit_ts <= ts` will arrive from this
    /// region.
    Resolved { region: RegionId, ts: Ts },
    /// The region split; children take over its range and inherit its
    /// resolved-ts until their own streams report.
    RegionSplit {
        parent: RegionId,
        children: Vec<RegionId>,
    },
    /// The region migrated or merged away; `replacement` now serves its
    /// range.
    RegionGone {
        region: RegionId,
        replacement: RegionId,
    },
}

/// Subscribes to the region-change streams covering a key span.
///
/// This is an external collaborator: production deployments adapt the
/// storage layer's change-stream client to it. The stream merges all
/// regions covering the span; region topology changes are reported inline.
///
/// Contract: right after subscribing, the client reports every region
/// currently covering the span with a `Resolved` at or below `from_ts`, so
/// the span-wide minimum is defined before any region advances.
#[async_trait]
pub trait RegionEventClient: Send + Sync + 'static {
    /// Subscribe from `from_ts` (exclusive). The channel closes when the
    /// upstream connection is lost; the puller resubscribes with backoff.
    async fn subscribe(&self, span: &Span, from_ts: Ts)
        -> Result<mpsc::Receiver<RegionFeedEvent>>;
}

//! The per-span puller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use riptide_core::model::{RawTxn, Span, Ts};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::{EntryBuffer, PullerEvent};
use crate::client::{RegionEventClient, RegionFeedEvent};
use crate::error::{PullerError, Result};
use crate::sorter::Sorter;
use crate::tracker::ResolvedTsTracker;

/// Merges the region streams covering one span into a single ordered
/// output of raw transactions plus resolved ticks.
///
/// [`Puller::run`] drives the subscription and fills the internal buffer;
/// [`Puller::collect_raw_txns`] drains the buffer through the sorter. The
/// two run as sibling tasks under one cancellation token.
pub struct Puller {
    client: Arc<dyn RegionEventClient>,
    span: Span,
    from_ts: Ts,
    buffer: EntryBuffer,
    tracker: Mutex<ResolvedTsTracker>,
    resolved: AtomicU64,
    cancel: CancellationToken,
}

impl Puller {
    pub fn new(
        client: Arc<dyn RegionEventClient>,
        span: Span,
        from_ts: Ts,
        buffer_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            span,
            from_ts,
            buffer: EntryBuffer::new(buffer_capacity, cancel.clone()),
            tracker: Mutex::new(ResolvedTsTracker::new()),
            resolved: AtomicU64::new(from_ts.0),
            cancel,
        }
    }

    /// The span-wide resolved-ts reached so far.
    pub fn resolved_ts(&self) -> Ts {
        Ts::new(self.resolved.load(Ordering::Acquire))
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Consume region feed events until cancellation or stream loss.
    pub async fn run(&self) -> Result<()> {
        let mut feed = self
            .client
            .subscribe(&self.span, self.from_ts)
            .await
            .map_err(|e| PullerError::Subscribe(e.to_string()))?;
        debug!(span = %self.span, from_ts = %self.from_ts, "puller subscribed");

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PullerError::Cancelled),
                event = feed.recv() => event,
            };
            let Some(event) = event else {
                return Err(PullerError::StreamClosed(format!(
                    "span {} feed ended",
                    self.span
                )));
            };
            match event {
                RegionFeedEvent::Entry { region, entry } => {
                    // A region that sends data before its first resolved
                    // report is tracked from the subscription floor.
                    {
                        let mut tracker = self.tracker.lock();
                        if tracker.get(region).is_none() {
                            tracker.update(region, self.from_ts);
                        }
                    }
                    self.buffer.add_entry(PullerEvent::Entry(entry)).await?;
                }
                RegionFeedEvent::Resolved { region, ts } => {
                    self.tracker.lock().update(region, ts);
                    self.advance_resolved().await?;
                }
                RegionFeedEvent::RegionSplit { parent, children } => {
                    self.tracker.lock().split(parent, &children);
                    self.advance_resolved().await?;
                }
                RegionFeedEvent::RegionGone {
                    region,
                    replacement,
                } => {
                    self.tracker.lock().replace(region, replacement);
                    self.advance_resolved().await?;
                }
            }
        }
    }

    /// Emit a resolved tick when the span minimum advanced.
    async fn advance_resolved(&self) -> Result<()> {
        let min = {
            let tracker = self.tracker.lock();
            match tracker.min() {
                Some(min) => min.max_with(self.from_ts),
                None => return Ok(()),
            }
        };
        let prev = self.resolved.load(Ordering::Acquire);
        if min.0 > prev {
            self.resolved.store(min.0, Ordering::Release);
            self.buffer.add_entry(PullerEvent::Resolved(min)).await?;
        }
        Ok(())
    }

    /// Drain the buffer through the sorter and emit raw transactions in
    /// non-decreasing commit-ts order. Each resolved tick is forwarded as
    /// an empty transaction after the data it releases.
    pub async fn collect_raw_txns(&self, output: mpsc::Sender<RawTxn>) -> Result<()> {
        let mut sorter = Sorter::new();
        loop {
            match self.buffer.get().await? {
                PullerEvent::Entry(entry) => sorter.push(entry),
                PullerEvent::Resolved(ts) => {
                    for txn in sorter.resolve(ts) {
                        output
                            .send(txn)
                            .await
                            .map_err(|_| PullerError::OutputClosed)?;
                    }
                    output
                        .send(RawTxn::resolved(ts))
                        .await
                        .map_err(|_| PullerError::OutputClosed)?;
                }
            }
        }
    }
}

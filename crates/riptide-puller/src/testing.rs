//! Scripted region client for tests and synthetic upstreams.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use riptide_core::model::{RawKVEntry, RegionId, Span, Ts};
use tokio::sync::mpsc;

use crate::client::{RegionEventClient, RegionFeedEvent};
use crate::error::Result;

const FEED_CAPACITY: usize = 4096;

#[derive(Default)]
struct ScriptedSpan {
    /// Everything ever pushed; replayed to late subscribers, mirroring a
    /// region client resuming from a checkpoint.
    history: Vec<RegionFeedEvent>,
    subscribers: Vec<mpsc::Sender<RegionFeedEvent>>,
    /// Set by [`ScriptHandle::close`]; the next push reopens the span.
    closed: bool,
}

/// A [`RegionEventClient`] whose feeds are driven by the test through
/// [`ScriptHandle`]s. Supports any number of concurrent subscribers (the
/// owner and every processor share the schema-change span); each gets the
/// full history followed by live events.
#[derive(Default)]
pub struct ScriptedRegionClient {
    spans: Mutex<HashMap<Vec<u8>, Arc<Mutex<ScriptedSpan>>>>,
}

impl ScriptedRegionClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn span(&self, span: &Span) -> Arc<Mutex<ScriptedSpan>> {
        self.spans
            .lock()
            .entry(span.start.clone())
            .or_default()
            .clone()
    }

    /// A handle for pushing events into the feed of `span`.
    pub fn handle(&self, span: &Span) -> ScriptHandle {
        ScriptHandle {
            span: self.span(span),
        }
    }
}

#[async_trait]
impl RegionEventClient for ScriptedRegionClient {
    async fn subscribe(
        &self,
        span: &Span,
        _from_ts: Ts,
    ) -> Result<mpsc::Receiver<RegionFeedEvent>> {
        let slot = self.span(span);
        let mut guard = slot.lock();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        for event in &guard.history {
            // Capacity is sized for scripted scenarios.
            let _ = tx.try_send(event.clone());
        }
        if guard.closed {
            // Connection loss was scripted: deliver history, then end the
            // stream by not registering the sender.
            return Ok(rx);
        }
        guard.subscribers.push(tx);
        Ok(rx)
    }
}

/// Pushes scripted events into one span's feed.
#[derive(Clone)]
pub struct ScriptHandle {
    span: Arc<Mutex<ScriptedSpan>>,
}

impl ScriptHandle {
    pub fn send(&self, event: RegionFeedEvent) {
        let mut guard = self.span.lock();
        guard.closed = false;
        guard.history.push(event.clone());
        guard.subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    pub fn entry(&self, region: RegionId, entry: RawKVEntry) {
        self.send(RegionFeedEvent::Entry { region, entry });
    }

    pub fn resolved(&self, region: RegionId, ts: Ts) {
        self.send(RegionFeedEvent::Resolved { region, ts });
    }

    pub fn split(&self, parent: RegionId, children: Vec<RegionId>) {
        self.send(RegionFeedEvent::RegionSplit { parent, children });
    }

    pub fn gone(&self, region: RegionId, replacement: RegionId) {
        self.send(RegionFeedEvent::RegionGone {
            region,
            replacement,
        });
    }

    /// Close every live feed, simulating upstream connection loss. A later
    /// push reopens the span for new subscribers.
    pub fn close(&self) {
        let mut guard = self.span.lock();
        guard.subscribers.clear();
        guard.closed = true;
    }
}

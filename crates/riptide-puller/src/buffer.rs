//! Bounded FIFO between the puller and its consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use riptide_core::model::{RawKVEntry, Ts};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{PullerError, Result};

/// What flows through the buffer: raw entries interleaved with span-wide
/// resolved ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullerEvent {
    Entry(RawKVEntry),
    Resolved(Ts),
}

/// A bounded FIFO with blocking enqueue and cooperative cancellation.
///
/// `add_entry` waits when the buffer is full, backpressuring the puller;
/// `get` waits when it is empty. Both return promptly with
/// [`PullerError::Cancelled`] once the shared token fires. Events are never
/// dropped on overflow.
pub struct EntryBuffer {
    queue: Mutex<VecDeque<PullerEvent>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
    cancel: CancellationToken,
}

impl EntryBuffer {
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        assert!(capacity > 0);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
            cancel,
        }
    }

    /// Enqueue one event, waiting for space when the buffer is full.
    pub async fn add_entry(&self, event: PullerEvent) -> Result<()> {
        let mut event = Some(event);
        loop {
            let notified = self.not_full.notified();
            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(event.take().expect("event consumed once"));
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PullerError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Dequeue one event, waiting when the buffer is empty.
    pub async fn get(&self) -> Result<PullerEvent> {
        loop {
            let notified = self.not_empty.notified();
            {
                let mut queue = self.queue.lock();
                if let Some(event) = queue.pop_front() {
                    self.not_full.notify_one();
                    return Ok(event);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(PullerError::Cancelled),
                _ = notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_and_read_in_order() {
        let buffer = Arc::new(EntryBuffer::new(16, CancellationToken::new()));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let first = buffer.get().await.unwrap();
                match first {
                    PullerEvent::Entry(e) => assert_eq!(e.commit_ts, Ts::new(110)),
                    other => panic!("expected entry, got {other:?}"),
                }
                let second = buffer.get().await.unwrap();
                assert_eq!(second, PullerEvent::Resolved(Ts::new(111)));
            })
        };

        buffer
            .add_entry(PullerEvent::Entry(RawKVEntry::put(
                vec![1],
                vec![],
                Ts::new(100),
                Ts::new(110),
            )))
            .await
            .unwrap();
        buffer
            .add_entry(PullerEvent::Resolved(Ts::new(111)))
            .await
            .unwrap();
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_then_drains() {
        let buffer = Arc::new(EntryBuffer::new(1, CancellationToken::new()));
        buffer
            .add_entry(PullerEvent::Resolved(Ts::new(1)))
            .await
            .unwrap();

        let writer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.add_entry(PullerEvent::Resolved(Ts::new(2))).await
            })
        };
        // The writer cannot finish until a slot frees up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        assert_eq!(buffer.get().await.unwrap(), PullerEvent::Resolved(Ts::new(1)));
        writer.await.unwrap().unwrap();
        assert_eq!(buffer.get().await.unwrap(), PullerEvent::Resolved(Ts::new(2)));
    }

    #[tokio::test]
    async fn test_waits_can_be_cancelled() {
        let cancel = CancellationToken::new();
        let buffer = Arc::new(EntryBuffer::new(1, cancel.clone()));
        buffer
            .add_entry(PullerEvent::Resolved(Ts::new(1)))
            .await
            .unwrap();

        // A blocked writer and a blocked reader (on a second buffer) both
        // observe cancellation promptly.
        let blocked_add = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.add_entry(PullerEvent::Resolved(Ts::new(2))).await
            })
        };
        let empty = Arc::new(EntryBuffer::new(1, cancel.clone()));
        let blocked_get = {
            let empty = empty.clone();
            tokio::spawn(async move { empty.get().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let add_err = tokio::time::timeout(Duration::from_millis(50), blocked_add)
            .await
            .expect("add must stop in time")
            .unwrap()
            .unwrap_err();
        assert!(add_err.is_cancelled());
        let get_err = tokio::time::timeout(Duration::from_millis(50), blocked_get)
            .await
            .expect("get must stop in time")
            .unwrap()
            .unwrap_err();
        assert!(get_err.is_cancelled());
    }
}

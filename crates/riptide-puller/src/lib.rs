//! # riptide-puller - From region streams to ordered raw transactions
//!
//! A puller subscribes to the region-change streams covering one key span,
//! tracks per-region resolved timestamps, and produces a single output of
//! raw entries plus span-wide resolved ticks. Downstream, the sorter turns
//! that loosely ordered stream into raw transactions with non-decreasing
//! commit timestamps.
//!
//! ```text
//! region streams -> Puller::run -> EntryBuffer -> Sorter -> RawTxn output
//!                      |
//!                ResolvedTsTracker (span resolved-ts = min over regions)
//! ```

pub mod buffer;
pub mod client;
pub mod error;
pub mod puller;
pub mod sorter;
pub mod testing;
pub mod tracker;

pub use buffer::{EntryBuffer, PullerEvent};
pub use client::{RegionEventClient, RegionFeedEvent};
pub use error::{PullerError, Result};
pub use puller::Puller;
pub use sorter::Sorter;
pub use tracker::ResolvedTsTracker;

//! # riptide-sink - Downstream sinks
//!
//! A [`Sink`] is anything a changefeed may emit into: a MySQL-compatible
//! database, a message bus, or a blackhole for testing. Delivery is
//! at-least-once everywhere, so every sink operation is idempotent
//! downstream: SQL rows are rendered as `REPLACE`/keyed `DELETE`, DDL
//! absorbs already-applied errors, and message-bus payloads carry commit
//! timestamps so readers can deduplicate.

pub mod blackhole;
pub mod codec;
pub mod error;
pub mod mq;
pub mod mysql;
pub mod sink;

pub use blackhole::BlackholeSink;
pub use error::{Result, SinkError};
pub use mq::{MemMessageBus, MessageBus, MqSink};
pub use mysql::MySqlSink;
pub use sink::{new_sink, MessageBusFactory, Sink};

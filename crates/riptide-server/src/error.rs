//! Server-side error taxonomy.
//!
//! Policy: recover locally when the fault is narrower than the containing
//! task (region stream loss, CAS conflicts); surface upward by failing the
//! task otherwise. The owner serializes terminal faults into the
//! changefeed status with a human-readable reason.

use riptide_meta::MetaError;
use riptide_puller::PullerError;
use riptide_schema::SchemaError;
use riptide_sink::SinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("metadata store: {0}")]
    Meta(#[from] MetaError),

    #[error("puller: {0}")]
    Puller(#[from] PullerError),

    #[error("schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Core(#[from] riptide_core::CoreError),

    /// The capture lost its lease; processors must stop and the lease race
    /// elects a successor.
    #[error("capture lease lost")]
    LeaseLost,

    /// The owner lock went to someone else; the controller exits silently.
    #[error("owner demoted")]
    Demoted,

    #[error("config error: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,
}

impl ServerError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            ServerError::Cancelled => true,
            ServerError::Meta(MetaError::Cancelled) => true,
            ServerError::Puller(e) => e.is_cancelled(),
            ServerError::Core(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Transient faults retried in place with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            ServerError::Meta(e) => e.is_retriable(),
            ServerError::Puller(e) => e.is_retriable(),
            ServerError::Sink(e) => e.is_retriable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

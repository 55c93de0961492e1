//! Puller errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PullerError {
    /// The upstream region stream ended; the caller reconnects with
    /// backoff.
    #[error("region stream closed: {0}")]
    StreamClosed(String),

    /// The region client rejected a subscription.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The output side went away before the puller finished.
    #[error("output channel closed")]
    OutputClosed,

    #[error("cancelled")]
    Cancelled,
}

impl PullerError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PullerError::StreamClosed(_) | PullerError::Subscribe(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PullerError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PullerError>;

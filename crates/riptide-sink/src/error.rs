//! Sink errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("the sink scheme ({0}) is not supported")]
    UnsupportedScheme(String),

    #[error("invalid sink uri: {0}")]
    InvalidUri(String),

    #[error("mysql error: {0}")]
    MySql(#[from] mysql_async::Error),

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("message of {size} bytes exceeds max-message-bytes {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("schema lookup failed for {0}.{1}")]
    SchemaLookup(String, String),

    #[error("cancelled")]
    Cancelled,
}

impl SinkError {
    /// Whether retrying with backoff can help.
    pub fn is_retriable(&self) -> bool {
        match self {
            SinkError::MySql(e) => is_transient_mysql_error(e),
            SinkError::Bus(_) => true,
            _ => false,
        }
    }
}

/// MySQL server errors worth retrying: deadlocks, lock waits, lost
/// connections. Driver/IO faults are retriable as well.
fn is_transient_mysql_error(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Server(server) => {
            matches!(server.code, 1205 | 1213 | 2006 | 2013)
        }
        mysql_async::Error::Io(_) => true,
        mysql_async::Error::Driver(_) => false,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, SinkError>;

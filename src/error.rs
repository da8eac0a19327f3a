use std::time::Duration;

/// Unified error taxonomy for the arena, wire codec, connection pool, async
/// client and query op handler. Kept flat and small so callers can match on
/// it directly instead of downcasting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("auth rejected: {0}")]
    AuthRejected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

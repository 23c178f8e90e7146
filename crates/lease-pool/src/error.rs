//! Error types for pool operations
//!
//! Optimistic-concurrency conflicts and malformed stored records never show up
//! here: the former are retried inside the pool, the latter are logged and
//! skipped. Empty pools and double releases are ordinary `Ok` results.

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection refused, dropped, or timed out. The next call reconnects.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered, but rejected the command or replied unexpectedly.
    #[error("store error: {0}")]
    Store(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// True for failures that a later retry may clear (connection/timeout).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

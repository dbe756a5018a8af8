use thiserror::Error;

/// Errors surfaced by the lines engine.
///
/// Poller failures never reach this type — they are logged and retried on
/// the next tick. Everything here propagates to the caller.
#[derive(Debug, Error)]
pub enum LinesError {
    /// A storage statement failed.
    #[error("storage operation failed: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No pooled connection became available within the allowed attempts.
    #[error("storage connections exhausted after {attempts} attempts")]
    InsufficientResources { attempts: u32 },

    /// The pool is shutting down and rejects new acquisitions.
    #[error("storage pool is draining")]
    Draining,

    /// Unusable input at construction time (bad storage path, bad sport
    /// name). Fatal to the operation that produced it.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport-level failure (listener bind, stream connect).
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

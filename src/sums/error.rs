//! SUMS errors.

/// Errors from the tagged queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// A sentinel was pushed; the queue no longer delivers or accepts entries.
    #[error("SUMS queue is closed")]
    Closed,
}

/// Errors surfaced to callers of the storage subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SumsError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The server runs without a storage subsystem.
    #[error("storage subsystem is not available in this session")]
    Unavailable,
    /// SUMS answered the request with a failure.
    #[error("storage request failed: {0}")]
    Failed(String),
    /// SUMS answered with a reply of the wrong kind.
    #[error("unexpected storage reply: {0:?}")]
    UnexpectedReply(super::SumsReply),
    /// No reply arrived in time.
    #[error("timed out waiting for the storage subsystem")]
    Timeout,
    /// The dispatcher task ended abnormally.
    #[error("SUMS dispatcher failed: {0}")]
    Dispatcher(#[from] tokio::task::JoinError),
}

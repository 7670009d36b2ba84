//! Session errors.

/// Errors raised by the shared session record.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The acceptor has passed the drain gate; no new clients are admitted.
    #[error("session is shutting down, no new clients are admitted")]
    AdmissionsClosed,
    /// The session record was already released by the exit protocol.
    #[error("session has been released")]
    Released,
}

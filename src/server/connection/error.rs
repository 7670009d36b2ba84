use crate::protocol::ProtocolError;

/// Connection error types.
///
/// Statement and storage failures are reported to the client and never end
/// the connection; these do.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

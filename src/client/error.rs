use crate::protocol::ProtocolError;

/// Errors seen by a module talking to the session server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The server answered with an error frame.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    #[error("server closed the connection")]
    Closed,
}

impl ClientError {
    /// SQLSTATE-style code of a server error frame.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Protocol parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid frame length: {0}")]
    InvalidLength(i32),
    #[error("unsupported protocol version: 0x{0:08x}")]
    UnsupportedProtocolVersion(u32),
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::ProtocolError;

/// Maximum frame size in bytes (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol version carried in `Hello`: major in the high 16 bits.
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Ensures that the buffer has at least `n` bytes remaining.
/// Returns `ProtocolError::InvalidMessage` if not enough bytes are available.
macro_rules! ensure_remaining {
    ($buf:expr, $n:expr) => {
        if $buf.len() < $n {
            return Err(ProtocolError::InvalidMessage);
        }
    };
}

pub(crate) use ensure_remaining;

/// Read a null-terminated string from a BytesMut buffer.
///
/// The search for the terminator is bounded to prevent unbounded memory
/// consumption from malicious input.
pub fn get_cstring(src: &mut BytesMut) -> Result<String, ProtocolError> {
    const MAX_CSTRING_LENGTH: usize = 64 * 1024; // 64KB limit

    let Some(null_pos) = src.iter().take(MAX_CSTRING_LENGTH).position(|&b| b == 0) else {
        return Err(ProtocolError::InvalidMessage);
    };

    let bytes = src.split_to(null_pos);
    src.advance(1);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read a nullable byte array from a BytesMut buffer.
///
/// Wire format: Int32 length (-1 for NULL, >= 0 for data), followed by data
/// bytes if length >= 0.
pub fn get_nullable_bytes(src: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    ensure_remaining!(src, 4);

    let len = src.get_i32();
    if len < 0 {
        return Ok(None);
    }

    let len = len as usize;
    ensure_remaining!(src, len);
    let bytes = src.split_to(len);
    Ok(Some(bytes.to_vec()))
}

/// Read a nullable UTF-8 string.
pub fn get_nullable_string(src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
    get_nullable_bytes(src)?
        .map(|bytes| String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8))
        .transpose()
}

pub fn get_u8(src: &mut BytesMut) -> Result<u8, ProtocolError> {
    ensure_remaining!(src, 1);
    Ok(src.get_u8())
}

pub fn get_u32(src: &mut BytesMut) -> Result<u32, ProtocolError> {
    ensure_remaining!(src, 4);
    Ok(src.get_u32())
}

pub fn get_u64(src: &mut BytesMut) -> Result<u64, ProtocolError> {
    ensure_remaining!(src, 8);
    Ok(src.get_u64())
}

pub fn get_i64(src: &mut BytesMut) -> Result<i64, ProtocolError> {
    ensure_remaining!(src, 8);
    Ok(src.get_i64())
}

pub fn get_bool(src: &mut BytesMut) -> Result<bool, ProtocolError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ProtocolError::InvalidMessage),
    }
}

/// Write a null-terminated string to a BytesMut buffer.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Write a nullable byte array (-1 length for NULL).
pub fn put_nullable_bytes(dst: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            dst.put_i32(bytes.len() as i32);
            dst.put_slice(bytes);
        }
        None => dst.put_i32(-1),
    }
}

/// Splits one complete frame off the buffer.
///
/// Returns the type byte and the body, or `None` if the frame is not complete
/// yet. The length field counts itself but not the type byte.
pub fn split_frame(
    src: &mut BytesMut,
    max_message_size: usize,
) -> Result<Option<(u8, BytesMut)>, ProtocolError> {
    // Need at least 5 bytes (type + length)
    if src.len() < 5 {
        return Ok(None);
    }

    // Peek at the length (bytes 1-4, don't consume yet)
    let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    if len < 4 || len as usize > max_message_size {
        return Err(ProtocolError::InvalidLength(len));
    }

    let total = 1 + len as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(total);
    let ty = frame.get_u8();
    frame.advance(4);
    Ok(Some((ty, frame)))
}

/// Writes a frame of type `ty` whose body is produced by `body`.
pub fn put_frame(dst: &mut BytesMut, ty: u8, body: impl FnOnce(&mut BytesMut)) {
    dst.put_u8(ty);
    let len_pos = dst.len();
    dst.put_i32(0);
    body(dst);
    let len = (dst.len() - len_pos) as i32;
    dst[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

/// Server side of the connection.
/// Decodes FrontendMessage (in frontend.rs) and encodes BackendMessage (in backend.rs).
pub struct ServerCodec {
    pub(crate) max_message_size: usize,
}

impl ServerCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Client side of the connection, the mirror of [`ServerCodec`].
pub struct ClientCodec {
    pub(crate) max_message_size: usize,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

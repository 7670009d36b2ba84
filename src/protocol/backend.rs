use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::codec::{
    ClientCodec, ServerCodec, get_cstring, get_i64, get_nullable_string, get_u8, get_u32, get_u64,
    put_cstring, put_frame, put_nullable_bytes, split_frame,
};
use crate::protocol::error::ProtocolError;
use crate::session::{SessionId, WorkerId};
use crate::sums::{SumsReply, Sunum};

/// Error codes carried in `Error` frames.
pub mod error_code {
    pub const INVALID_AUTHORIZATION: &str = "28000";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const IN_FAILED_TRANSACTION: &str = "25P02";
    pub const INVALID_TRANSACTION_STATE: &str = "25000";
    pub const SQL_ERROR: &str = "42000";
    pub const STORAGE_ERROR: &str = "58000";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Messages sent by the backend (server) to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// 'R' - Handshake accepted
    AuthOk { worker: WorkerId, session: SessionId },
    /// 'C' - Statement without a result set completed
    CommandComplete { tag: String },
    /// 'D' - Result set
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
    /// 'S' - Storage request queued
    SumsSubmitted { pending: u32 },
    /// 'U' - Storage reply
    SumsReply(SumsReply),
    /// 'E' - Error response
    Error { code: String, message: String },
}

impl BackendMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        BackendMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            BackendMessage::AuthOk { worker, session } => put_frame(dst, b'R', |dst| {
                dst.put_u32(worker.get());
                dst.put_i64(session.get());
            }),
            BackendMessage::CommandComplete { tag } => {
                put_frame(dst, b'C', |dst| put_cstring(dst, tag));
            }
            BackendMessage::Rows { columns, rows } => put_frame(dst, b'D', |dst| {
                dst.put_u16(columns.len() as u16);
                for column in columns {
                    put_cstring(dst, column);
                }
                dst.put_u32(rows.len() as u32);
                for row in rows {
                    for value in row {
                        put_nullable_bytes(dst, value.as_deref().map(str::as_bytes));
                    }
                }
            }),
            BackendMessage::SumsSubmitted { pending } => {
                put_frame(dst, b'S', |dst| dst.put_u32(*pending));
            }
            BackendMessage::SumsReply(reply) => put_frame(dst, b'U', |dst| encode_reply(reply, dst)),
            BackendMessage::Error { code, message } => put_frame(dst, b'E', |dst| {
                put_cstring(dst, code);
                put_cstring(dst, message);
            }),
        }
    }

    fn decode(msg_type: u8, src: &mut BytesMut) -> Result<Self, ProtocolError> {
        match msg_type {
            b'R' => {
                let worker = WorkerId::new(get_u32(src)?);
                let session = SessionId::new(get_i64(src)?);
                Ok(BackendMessage::AuthOk { worker, session })
            }
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: get_cstring(src)?,
            }),
            b'D' => {
                if src.len() < 2 {
                    return Err(ProtocolError::InvalidMessage);
                }
                let ncols = src.get_u16() as usize;
                let columns = (0..ncols)
                    .map(|_| get_cstring(src))
                    .collect::<Result<Vec<_>, _>>()?;
                let nrows = get_u32(src)? as usize;
                // Each value takes at least its 4-byte length.
                if nrows.saturating_mul(ncols) > src.len() / 4 {
                    return Err(ProtocolError::InvalidMessage);
                }
                let mut rows = Vec::with_capacity(nrows);
                for _ in 0..nrows {
                    let row = (0..ncols)
                        .map(|_| get_nullable_string(src))
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.push(row);
                }
                Ok(BackendMessage::Rows { columns, rows })
            }
            b'S' => Ok(BackendMessage::SumsSubmitted {
                pending: get_u32(src)?,
            }),
            b'U' => Ok(BackendMessage::SumsReply(decode_reply(src)?)),
            b'E' => {
                let code = get_cstring(src)?;
                let message = get_cstring(src)?;
                Ok(BackendMessage::Error { code, message })
            }
            _ => Err(ProtocolError::UnknownMessageType(msg_type)),
        }
    }
}

fn encode_reply(reply: &SumsReply, dst: &mut BytesMut) {
    match reply {
        SumsReply::Allocated { sunum, path } => {
            dst.put_u8(b'a');
            dst.put_u64(sunum.get());
            put_cstring(dst, &path.to_string_lossy());
        }
        SumsReply::Located { units } => {
            dst.put_u8(b'l');
            dst.put_u32(units.len() as u32);
            for (sunum, path) in units {
                dst.put_u64(sunum.get());
                let path = path.as_ref().map(|p| p.to_string_lossy());
                put_nullable_bytes(dst, path.as_deref().map(str::as_bytes));
            }
        }
        SumsReply::Stored { sunum } => {
            dst.put_u8(b's');
            dst.put_u64(sunum.get());
        }
        SumsReply::Failed { reason } => {
            dst.put_u8(b'f');
            put_cstring(dst, reason);
        }
    }
}

fn decode_reply(src: &mut BytesMut) -> Result<SumsReply, ProtocolError> {
    match get_u8(src)? {
        b'a' => {
            let sunum = Sunum::new(get_u64(src)?);
            let path = PathBuf::from(get_cstring(src)?);
            Ok(SumsReply::Allocated { sunum, path })
        }
        b'l' => {
            let count = get_u32(src)? as usize;
            if count > src.len() / 12 {
                return Err(ProtocolError::InvalidMessage);
            }
            let units = (0..count)
                .map(|_| {
                    let sunum = Sunum::new(get_u64(src)?);
                    let path = get_nullable_string(src)?.map(PathBuf::from);
                    Ok((sunum, path))
                })
                .collect::<Result<_, ProtocolError>>()?;
            Ok(SumsReply::Located { units })
        }
        b's' => Ok(SumsReply::Stored {
            sunum: Sunum::new(get_u64(src)?),
        }),
        b'f' => Ok(SumsReply::Failed {
            reason: get_cstring(src)?,
        }),
        _ => Err(ProtocolError::InvalidMessage),
    }
}

impl Encoder<BackendMessage> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: BackendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = BackendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((msg_type, mut body)) = split_frame(src, self.max_message_size)? else {
            return Ok(None);
        };
        let msg = BackendMessage::decode(msg_type, &mut body)?;
        if !body.is_empty() {
            return Err(ProtocolError::InvalidMessage);
        }
        Ok(Some(msg))
    }
}

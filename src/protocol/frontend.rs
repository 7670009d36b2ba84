use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::codec::{
    ClientCodec, ServerCodec, get_bool, get_cstring, get_i64, get_nullable_string, get_u32, get_u64,
    put_cstring, put_frame, put_nullable_bytes, split_frame,
};
use crate::protocol::error::ProtocolError;
use crate::sums::Sunum;

/// The first frame a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub user: String,
    /// The session key from the announcement file.
    pub key: Option<String>,
    /// Run this client's statements under per-statement savepoints.
    pub no_share: bool,
}

/// Messages sent by the frontend (client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// 'H' - Authentication handshake
    Hello(Hello),
    /// 'Q' - Run SQL against the shared transaction
    Query(String),
    /// 'T' - Register a transient record, deleted at commit
    MarkTransient { series: String, recnum: i64 },
    /// 'A' - Allocate a storage unit
    SumsAlloc { bytes: u64 },
    /// 'G' - Locate storage units
    SumsGet { sunums: Vec<Sunum>, retrieve: bool },
    /// 'W' - Wait for the oldest pending storage reply
    SumsWait,
    /// 'X' - Termination
    Terminate,
}

impl FrontendMessage {
    /// Decodes a frontend message body whose frame header has been consumed.
    fn decode(msg_type: u8, src: &mut BytesMut) -> Result<Self, ProtocolError> {
        match msg_type {
            b'H' => {
                let version = get_u32(src)?;
                let user = get_cstring(src)?;
                let key = get_nullable_string(src)?;
                let no_share = get_bool(src)?;
                Ok(FrontendMessage::Hello(Hello {
                    version,
                    user,
                    key,
                    no_share,
                }))
            }
            b'Q' => Ok(FrontendMessage::Query(get_cstring(src)?)),
            b'T' => {
                let series = get_cstring(src)?;
                let recnum = get_i64(src)?;
                Ok(FrontendMessage::MarkTransient { series, recnum })
            }
            b'A' => Ok(FrontendMessage::SumsAlloc {
                bytes: get_u64(src)?,
            }),
            b'G' => {
                let retrieve = get_bool(src)?;
                let count = get_u32(src)? as usize;
                // Every sunum takes 8 bytes; reject counts the body cannot hold.
                if count > src.len() / 8 {
                    return Err(ProtocolError::InvalidMessage);
                }
                let sunums = (0..count)
                    .map(|_| get_u64(src).map(Sunum::new))
                    .collect::<Result<_, _>>()?;
                Ok(FrontendMessage::SumsGet { sunums, retrieve })
            }
            b'W' => Ok(FrontendMessage::SumsWait),
            b'X' => Ok(FrontendMessage::Terminate),
            _ => Err(ProtocolError::UnknownMessageType(msg_type)),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        match self {
            FrontendMessage::Hello(hello) => put_frame(dst, b'H', |dst| {
                dst.put_u32(hello.version);
                put_cstring(dst, &hello.user);
                put_nullable_bytes(dst, hello.key.as_deref().map(str::as_bytes));
                dst.put_u8(hello.no_share as u8);
            }),
            FrontendMessage::Query(sql) => put_frame(dst, b'Q', |dst| put_cstring(dst, sql)),
            FrontendMessage::MarkTransient { series, recnum } => put_frame(dst, b'T', |dst| {
                put_cstring(dst, series);
                dst.put_i64(*recnum);
            }),
            FrontendMessage::SumsAlloc { bytes } => {
                put_frame(dst, b'A', |dst| dst.put_u64(*bytes));
            }
            FrontendMessage::SumsGet { sunums, retrieve } => put_frame(dst, b'G', |dst| {
                dst.put_u8(*retrieve as u8);
                dst.put_u32(sunums.len() as u32);
                for sunum in sunums {
                    dst.put_u64(sunum.get());
                }
            }),
            FrontendMessage::SumsWait => put_frame(dst, b'W', |_| {}),
            FrontendMessage::Terminate => put_frame(dst, b'X', |_| {}),
        }
    }
}

impl Decoder for ServerCodec {
    type Item = FrontendMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((msg_type, mut body)) = split_frame(src, self.max_message_size)? else {
            return Ok(None);
        };
        let msg = FrontendMessage::decode(msg_type, &mut body)?;
        if !body.is_empty() {
            return Err(ProtocolError::InvalidMessage);
        }
        Ok(Some(msg))
    }
}

impl Encoder<FrontendMessage> for ClientCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: FrontendMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

//! Module-side connection to a running session.
//!
//! A thin request/response wrapper over [`ClientCodec`]: every call sends one
//! frame and reads exactly one reply.

mod error;

pub use error::ClientError;

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::db::QueryResult;
use crate::protocol::{BackendMessage, ClientCodec, FrontendMessage, Hello, PROTOCOL_VERSION};
use crate::session::{SessionId, WorkerId};
use crate::sums::{SumsReply, Sunum};

/// What a module presents in its `Hello`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user: String,
    pub key: Option<String>,
    pub no_share: bool,
}

impl ClientOptions {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key: None,
            no_share: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_no_share(mut self, no_share: bool) -> Self {
        self.no_share = no_share;
        self
    }
}

pub struct Client {
    framed: Framed<TcpStream, ClientCodec>,
    worker: WorkerId,
    session: SessionId,
}

impl Client {
    /// Connects and authenticates.
    pub async fn connect(addr: SocketAddr, options: &ClientOptions) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, ClientCodec::new());

        framed
            .send(FrontendMessage::Hello(Hello {
                version: PROTOCOL_VERSION,
                user: options.user.clone(),
                key: options.key.clone(),
                no_share: options.no_share,
            }))
            .await?;

        match next_reply(&mut framed).await? {
            BackendMessage::AuthOk { worker, session } => Ok(Self {
                framed,
                worker,
                session,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Runs a statement in the shared transaction.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult, ClientError> {
        match self.request(FrontendMessage::Query(sql.to_string())).await? {
            BackendMessage::CommandComplete { tag } => {
                let rows = tag
                    .rsplit(' ')
                    .next()
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(0);
                Ok(QueryResult::Command { tag, rows })
            }
            BackendMessage::Rows { columns, rows } => Ok(QueryResult::Rows { columns, rows }),
            other => Err(unexpected(other)),
        }
    }

    /// Registers a record to be deleted when the session commits.
    pub async fn mark_transient(&mut self, series: &str, recnum: i64) -> Result<(), ClientError> {
        let message = FrontendMessage::MarkTransient {
            series: series.to_string(),
            recnum,
        };
        match self.request(message).await? {
            BackendMessage::CommandComplete { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Queues an allocation; returns how many replies are now pending.
    pub async fn sums_alloc(&mut self, bytes: u64) -> Result<u32, ClientError> {
        let reply = self.request(FrontendMessage::SumsAlloc { bytes }).await?;
        submitted(reply)
    }

    /// Queues a lookup; returns how many replies are now pending.
    pub async fn sums_get(
        &mut self,
        sunums: Vec<Sunum>,
        retrieve: bool,
    ) -> Result<u32, ClientError> {
        let reply = self
            .request(FrontendMessage::SumsGet { sunums, retrieve })
            .await?;
        submitted(reply)
    }

    /// Waits for the oldest pending storage reply.
    pub async fn sums_wait(&mut self) -> Result<SumsReply, ClientError> {
        match self.request(FrontendMessage::SumsWait).await? {
            BackendMessage::SumsReply(reply) => Ok(reply),
            other => Err(unexpected(other)),
        }
    }

    /// Says goodbye and closes the socket.
    pub async fn terminate(mut self) -> Result<(), ClientError> {
        self.framed.send(FrontendMessage::Terminate).await?;
        self.framed.close().await?;
        Ok(())
    }

    async fn request(&mut self, message: FrontendMessage) -> Result<BackendMessage, ClientError> {
        self.framed.send(message).await?;
        next_reply(&mut self.framed).await
    }
}

/// Reads one frame, turning error frames into [`ClientError::Server`].
async fn next_reply(
    framed: &mut Framed<TcpStream, ClientCodec>,
) -> Result<BackendMessage, ClientError> {
    match framed.next().await {
        Some(Ok(BackendMessage::Error { code, message })) => {
            Err(ClientError::Server { code, message })
        }
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e.into()),
        None => Err(ClientError::Closed),
    }
}

fn submitted(reply: BackendMessage) -> Result<u32, ClientError> {
    match reply {
        BackendMessage::SumsSubmitted { pending } => Ok(pending),
        other => Err(unexpected(other)),
    }
}

fn unexpected(message: BackendMessage) -> ClientError {
    ClientError::Unexpected(format!("{message:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerCodec, error_code};
    use tokio::net::TcpListener;

    /// Accepts one connection and answers the handshake with `reply`.
    async fn one_shot(reply: BackendMessage) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, ServerCodec::new());
            let hello = framed.next().await.unwrap().unwrap();
            assert!(matches!(hello, FrontendMessage::Hello(_)));
            framed.send(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_reads_worker_and_session() {
        let addr = one_shot(BackendMessage::AuthOk {
            worker: WorkerId::new(3),
            session: SessionId::new(42),
        })
        .await;

        let client = Client::connect(addr, &ClientOptions::new("alice")).await.unwrap();
        assert_eq!(client.worker(), WorkerId::new(3));
        assert_eq!(client.session(), SessionId::new(42));
    }

    #[tokio::test]
    async fn test_error_frame_becomes_server_error() {
        let addr = one_shot(BackendMessage::error(
            error_code::INVALID_AUTHORIZATION,
            "bad key",
        ))
        .await;

        let err = Client::connect(addr, &ClientOptions::new("alice"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(error_code::INVALID_AUTHORIZATION));
    }
}

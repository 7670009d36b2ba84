use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::{
    BackendMessage, FrontendMessage, Hello, PROTOCOL_VERSION, ProtocolError, ServerCodec,
    error_code,
};

/// Shared secret clients must present in `Hello`.
///
/// Published only through the announcement file.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Why a `Hello` was refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unsupported protocol version 0x{0:08x}")]
    UnsupportedVersion(u32),
    #[error("user name is empty")]
    EmptyUser,
    #[error("user '{0}' is not allowed to join this session")]
    UserNotAllowed(String),
    #[error("session key required")]
    MissingKey,
    #[error("session key does not match")]
    WrongKey,
}

/// Errors ending a handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("expected Hello, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("connection closed during handshake")]
    Closed,
    #[error("handshake timed out")]
    Timeout,
}

/// Identity established by a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub no_share: bool,
}

/// Checks `Hello` frames against the session key and the allowed users.
#[derive(Debug, Clone)]
pub struct Authenticator {
    key: SessionKey,
    require_key: bool,
    allowed_users: Vec<String>,
}

impl Authenticator {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            require_key: true,
            allowed_users: Vec::new(),
        }
    }

    pub fn with_require_key(mut self, require_key: bool) -> Self {
        self.require_key = require_key;
        self
    }

    /// Restricts the session to `users`. An empty list allows everyone.
    pub fn with_allowed_users(mut self, users: Vec<String>) -> Self {
        self.allowed_users = users;
        self
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn authenticate(&self, hello: &Hello) -> Result<Credentials, AuthError> {
        if hello.version >> 16 != PROTOCOL_VERSION >> 16 {
            return Err(AuthError::UnsupportedVersion(hello.version));
        }
        if hello.user.is_empty() {
            return Err(AuthError::EmptyUser);
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&hello.user) {
            return Err(AuthError::UserNotAllowed(hello.user.clone()));
        }
        match hello.key.as_deref() {
            Some(key) if key == self.key.as_str() => {}
            Some(_) => return Err(AuthError::WrongKey),
            None if self.require_key => return Err(AuthError::MissingKey),
            None => {}
        }
        Ok(Credentials {
            user: hello.user.clone(),
            no_share: hello.no_share,
        })
    }
}

/// A single client handshake.
pub struct Handshake {
    framed: Framed<TcpStream, ServerCodec>,
    peer: SocketAddr,
}

impl Handshake {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            framed: Framed::new(socket, ServerCodec::new()),
            peer,
        }
    }

    /// Reads the `Hello` and authenticates it.
    ///
    /// On failure the client gets an error frame before the socket is
    /// dropped. The success frame is sent later, once the client has been
    /// admitted.
    pub async fn run(
        mut self,
        auth: &Authenticator,
        timeout: Duration,
    ) -> Result<(Framed<TcpStream, ServerCodec>, Credentials), HandshakeError> {
        let result = match tokio::time::timeout(timeout, self.read_hello()).await {
            Ok(Ok(hello)) => auth.authenticate(&hello).map_err(HandshakeError::from),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(HandshakeError::Timeout),
        };

        match result {
            Ok(credentials) => {
                tracing::debug!(peer = %self.peer, user = %credentials.user, "handshake complete");
                Ok((self.framed, credentials))
            }
            Err(e) => {
                if !matches!(e, HandshakeError::Closed) {
                    let code = match &e {
                        HandshakeError::Auth(_) => error_code::INVALID_AUTHORIZATION,
                        _ => error_code::PROTOCOL_VIOLATION,
                    };
                    let _ = self.framed.send(BackendMessage::error(code, e.to_string())).await;
                }
                Err(e)
            }
        }
    }

    async fn read_hello(&mut self) -> Result<Hello, HandshakeError> {
        match self.framed.next().await {
            Some(Ok(FrontendMessage::Hello(hello))) => Ok(hello),
            Some(Ok(other)) => Err(HandshakeError::UnexpectedMessage(message_name(&other))),
            Some(Err(e)) => Err(e.into()),
            None => Err(HandshakeError::Closed),
        }
    }
}

fn message_name(message: &FrontendMessage) -> &'static str {
    match message {
        FrontendMessage::Hello(_) => "Hello",
        FrontendMessage::Query(_) => "Query",
        FrontendMessage::MarkTransient { .. } => "MarkTransient",
        FrontendMessage::SumsAlloc { .. } => "SumsAlloc",
        FrontendMessage::SumsGet { .. } => "SumsGet",
        FrontendMessage::SumsWait => "SumsWait",
        FrontendMessage::Terminate => "Terminate",
    }
}

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::{BackendMessage, error_code};
use crate::server::connection::Connection;
use crate::server::handshake::{Authenticator, Handshake};
use crate::session::Session;
use crate::shutdown::{Operator, ShutdownHandle, ShutdownRequest, ShutdownState, Terminal};
use crate::sums::SumsQueue;

/// Acceptor timing.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Upper bound on how long the loop waits before re-reading the shutdown
    /// state.
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the acceptor gets its connections from.
pub trait Listener: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    StateChanged,
    Tick,
}

/// The connection acceptor.
///
/// Accepts and authenticates clients until the shutdown state turns
/// terminal, then closes admissions and returns that state to the
/// coordinator. Listener failures are escalated as a `MainDriven` request,
/// never handled by exiting.
pub struct Server<L = TcpListener> {
    listener: L,
    session: Arc<Session>,
    shutdown: ShutdownHandle,
    authenticator: Arc<Authenticator>,
    sums: Option<Arc<SumsQueue>>,
    operator: Arc<dyn Operator>,
    options: ServerOptions,
}

impl<L: Listener> Server<L> {
    pub fn new(
        listener: L,
        session: Arc<Session>,
        shutdown: ShutdownHandle,
        authenticator: Authenticator,
    ) -> Self {
        Self {
            listener,
            session,
            shutdown,
            authenticator: Arc::new(authenticator),
            sums: None,
            operator: Arc::new(Terminal),
            options: ServerOptions::default(),
        }
    }

    pub fn with_sums(mut self, queue: Arc<SumsQueue>) -> Self {
        self.sums = Some(queue);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop and returns the terminal state that stopped it.
    pub async fn serve(mut self) -> ShutdownState {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "accepting clients");
        loop {
            let state = self.shutdown.observe();
            if state.is_terminal() {
                self.drain(state).await;
                return state;
            }

            let event = tokio::select! {
                accepted = self.listener.accept() => Event::Accepted(accepted),
                _ = self.shutdown.changed() => Event::StateChanged,
                _ = tokio::time::sleep(self.options.poll_interval) => Event::Tick,
            };

            match event {
                Event::Accepted(Ok((socket, peer))) => self.spawn_client(socket, peer),
                Event::Accepted(Err(e)) if is_transient(&e) => {
                    tracing::debug!(error = %e, "transient accept error");
                }
                Event::Accepted(Err(e)) => {
                    tracing::error!(error = %e, "listener failed, stopping the session");
                    self.shutdown.request(ShutdownRequest::MainDriven);
                    let state = self.shutdown.terminal().await;
                    self.drain(state).await;
                    return state;
                }
                Event::StateChanged | Event::Tick => {}
            }
        }
    }

    /// Stops admissions and, if the operator agrees, waits for active
    /// clients to leave.
    async fn drain(&self, state: ShutdownState) {
        let active = self.session.close_admissions();
        if active == 0 {
            tracing::info!(%state, "no active clients, stopping");
            return;
        }

        let operator = Arc::clone(&self.operator);
        let wait = tokio::task::spawn_blocking(move || operator.confirm_wait(active, state))
            .await
            .unwrap_or(false);
        if wait {
            tracing::info!(active, %state, "waiting for active clients");
            self.session.wait_for_drain().await;
            tracing::info!("all clients finished");
        } else {
            tracing::warn!(active, %state, "not waiting for active clients");
        }
    }

    fn spawn_client(&self, socket: TcpStream, peer: SocketAddr) {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let session = Arc::clone(&self.session);
        let authenticator = Arc::clone(&self.authenticator);
        let sums = self.sums.clone();
        let timeout = self.options.handshake_timeout;

        tracing::debug!(%peer, "accepted connection");

        tokio::spawn(async move {
            let (mut framed, credentials) =
                match Handshake::new(socket, peer).run(&authenticator, timeout).await {
                    Ok(done) => done,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "handshake failed");
                        return;
                    }
                };

            let slot = match session.admit_client() {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::info!(%peer, error = %e, "client refused");
                    let _ = framed
                        .send(BackendMessage::error(error_code::ADMIN_SHUTDOWN, e.to_string()))
                        .await;
                    return;
                }
            };

            let worker = slot.worker();
            tracing::info!(
                %peer,
                %worker,
                user = %credentials.user,
                no_share = credentials.no_share,
                "client admitted"
            );
            let connection = Connection::new(framed, slot, &credentials, sums);
            if let Err(e) = connection.run().await {
                tracing::warn!(%worker, error = %e, "connection error");
            }
            tracing::info!(%worker, "client disconnected");
        });
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

//! Session startup.
//!
//! [`App`] wires the components together in the order the session needs
//! them: status record, shared transaction, listener, storage subsystem and
//! session log, `BEGIN`, and finally the announcement file. Once every step
//! succeeded the acceptor and the coordinator are spawned and a
//! [`RunningApp`] is handed back.
//!
//! A failure before the storage subsystem is up marks the status record
//! aborted. A later failure runs the regular abort path, so a half-started
//! session is torn down the same way as any other.

mod error;

pub use error::StartupError;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::db::{
    DbConnection, IsolationLevel, SessionCatalog, SessionStatus, SharedTransaction,
    SqliteConnection,
};
use crate::exit::{ExitOptions, ExitProtocol, ExitStatus, SumsRuntime};
use crate::logging::SessionLog;
use crate::server::{Announcement, Authenticator, Server, ServerOptions, SessionKey};
use crate::session::{Endpoint, Session, SessionId, WorkerId};
use crate::shutdown::{self, ControlSignals, Operator, ShutdownHandle, ShutdownState};
use crate::sums::{
    DirSums, StorageUnit, SumsDispatcher, SumsError, SumsQueue, SumsReply, SumsRequest,
    SumsService, UnitKind,
};

/// Builder for one server session.
pub struct App {
    config: ServerConfig,
    user: String,
    database: Option<Box<dyn DbConnection>>,
    status_database: Option<Box<dyn DbConnection>>,
    sums_service: Option<Box<dyn SumsService>>,
    operator: Option<Arc<dyn Operator>>,
    log: SessionLog,
}

impl App {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            user: "drms".to_string(),
            database: None,
            status_database: None,
            sums_service: None,
            operator: None,
            log: SessionLog::new(),
        }
    }

    /// User recorded as the owner of the session.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Connection for the shared transaction, replacing `database.path`.
    pub fn with_database(mut self, conn: Box<dyn DbConnection>) -> Self {
        self.database = Some(conn);
        self
    }

    /// Connection for the status table, replacing `database.status_path`.
    pub fn with_status_database(mut self, conn: Box<dyn DbConnection>) -> Self {
        self.status_database = Some(conn);
        self
    }

    /// Storage backend, used even when `sums.enabled` is off.
    pub fn with_sums_service(mut self, service: Box<dyn SumsService>) -> Self {
        self.sums_service = Some(service);
        self
    }

    /// Overrides the operator derived from `shutdown.wait_for_clients`.
    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    /// The log writer the tracing subscriber was installed with.
    pub fn with_session_log(mut self, log: SessionLog) -> Self {
        self.log = log;
        self
    }

    /// Brings the session up and starts accepting clients.
    pub async fn start(mut self) -> Result<RunningApp, StartupError> {
        let database: Box<dyn DbConnection> = match self.database.take() {
            Some(conn) => conn,
            None => Box::new(SqliteConnection::open(&self.config.database.path)?),
        };
        let status: Box<dyn DbConnection> = match self.status_database.take() {
            Some(conn) => conn,
            None => Box::new(SqliteConnection::open(&self.config.database.status_path)?),
        };

        let mut catalog = SessionCatalog::open(status)?;
        let pid = std::process::id();
        let id = catalog.start_session(&self.user, pid)?;
        tracing::info!(session = %id, user = %self.user, pid, "starting session");

        let early = match self.prepare(database, &mut catalog, id).await {
            Ok(early) => early,
            Err(e) => {
                abandon(catalog, id, &e);
                return Err(e);
            }
        };

        let options = ExitOptions {
            abort_grace: self.config.shutdown.abort_grace(),
            sums_timeout: self.config.sums.timeout(),
        };
        let mut exit = ExitProtocol::new(Arc::clone(&early.session), catalog, self.log.clone())
            .with_options(options);
        let queue = early.sums.as_ref().map(|sums| Arc::clone(&sums.queue));
        if let Some(sums) = early.sums {
            exit = exit.with_sums(sums);
        }

        let key = SessionKey::generate();
        let announcement_path = Announcement::path(&self.config.announce.prefix, pid);
        let published = self
            .publish(&early.session, queue.as_deref(), &early.endpoint, &key, &announcement_path)
            .await;
        if let Err(e) = published {
            tracing::error!(session = %id, error = %e, "session failed to start, aborting");
            exit.run(ShutdownState::AbortRequested).await;
            return Err(e);
        }

        let (coordinator, handle) = shutdown::channel();
        let authenticator = Authenticator::new(key.clone())
            .with_require_key(self.config.auth.require_key)
            .with_allowed_users(self.config.auth.allowed_users.clone());
        let operator = self
            .operator
            .take()
            .unwrap_or_else(|| self.config.shutdown.wait_for_clients.operator());
        let mut server = Server::new(
            early.listener,
            Arc::clone(&early.session),
            handle.clone(),
            authenticator,
        )
        .with_operator(operator)
        .with_options(ServerOptions {
            poll_interval: self.config.listener.poll_interval(),
            handshake_timeout: self.config.listener.handshake_timeout(),
        });
        if let Some(queue) = queue {
            server = server.with_sums(queue);
        }

        let acceptor = tokio::spawn(server.serve());
        let coordinator = tokio::spawn(coordinator.run(acceptor, exit));

        tracing::info!(
            session = %id,
            endpoint = %early.endpoint,
            announcement = %announcement_path.display(),
            "session ready"
        );

        Ok(RunningApp {
            local_addr: early.local_addr,
            session: early.session,
            shutdown: handle,
            announcement_path,
            key,
            coordinator,
        })
    }

    /// Steps that leave nothing behind except the status record.
    async fn prepare(
        &mut self,
        database: Box<dyn DbConnection>,
        catalog: &mut SessionCatalog,
        id: SessionId,
    ) -> Result<Prepared, StartupError> {
        let mut tx = SharedTransaction::new(database);
        tx.bootstrap()?;
        let isolation = if self.config.database.no_share {
            None
        } else {
            Some(IsolationLevel::Serializable)
        };
        let session = Arc::new(Session::new(id, tx, self.config.sums.policy(), isolation));

        let listener = &self.config.listener;
        let addr = format!("{}:{}", listener.host, listener.port);
        let tcp = TcpListener::bind(&addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;
        let endpoint = Endpoint {
            host: advertised_host(listener.advertise_host.as_deref(), local_addr.ip()),
            port: local_addr.port(),
        };
        session.set_endpoint(endpoint.clone());
        catalog.record_endpoint(id, &endpoint)?;

        let sums = self.start_sums()?;

        Ok(Prepared {
            session,
            listener: tcp,
            local_addr,
            endpoint,
            sums,
        })
    }

    fn start_sums(&mut self) -> Result<Option<SumsRuntime>, StartupError> {
        let service: Box<dyn SumsService> = match self.sums_service.take() {
            Some(service) => service,
            None if self.config.sums.enabled => {
                let root = &self.config.sums.root;
                Box::new(DirSums::open(root).map_err(|source| StartupError::SumsRoot {
                    path: root.clone(),
                    source,
                })?)
            }
            None => {
                tracing::info!("running without a storage subsystem");
                return Ok(None);
            }
        };
        let queue = Arc::new(SumsQueue::new());
        let dispatcher = SumsDispatcher::spawn(Arc::clone(&queue), service);
        Ok(Some(SumsRuntime { queue, dispatcher }))
    }

    /// Allocates the log unit, begins the shared transaction and writes the
    /// announcement file.
    async fn publish(
        &self,
        session: &Arc<Session>,
        queue: Option<&SumsQueue>,
        endpoint: &Endpoint,
        key: &SessionKey,
        announcement_path: &Path,
    ) -> Result<(), StartupError> {
        if let Some(queue) = queue {
            let request = SumsRequest::Alloc { bytes: 0 };
            match queue
                .call(WorkerId::SESSION, request, self.config.sums.timeout())
                .await?
            {
                SumsReply::Allocated { sunum, path } => {
                    self.log.attach(&path).map_err(StartupError::Log)?;
                    tracing::info!(%sunum, path = %path.display(), "session log attached");
                    session.set_log_unit(StorageUnit {
                        sunum,
                        path,
                        kind: UnitKind::Log,
                    });
                }
                SumsReply::Failed { reason } => return Err(SumsError::Failed(reason).into()),
                other => return Err(SumsError::UnexpectedReply(other).into()),
            }
        }

        let isolation = session.isolation();
        let shared = Arc::clone(session);
        tokio::task::spawn_blocking(move || shared.with_transaction(|tx| tx.begin(isolation)))
            .await??;
        tracing::info!(session = %session.id(), ?isolation, "shared transaction started");

        let announcement = Announcement {
            host: endpoint.host.clone(),
            port: endpoint.port,
            pid: std::process::id(),
            key: key.as_str().to_string(),
        };
        announcement
            .write(announcement_path, self.config.announce.syntax)
            .map_err(|source| StartupError::Announce {
                path: announcement_path.to_path_buf(),
                source,
            })?;
        let path = announcement_path.to_path_buf();
        session.on_release(move || remove_announcement(&path));
        Ok(())
    }
}

struct Prepared {
    session: Arc<Session>,
    listener: TcpListener,
    local_addr: SocketAddr,
    endpoint: Endpoint,
    sums: Option<SumsRuntime>,
}

/// A session that is accepting clients.
pub struct RunningApp {
    local_addr: SocketAddr,
    session: Arc<Session>,
    shutdown: ShutdownHandle,
    announcement_path: PathBuf,
    key: SessionKey,
    coordinator: JoinHandle<ExitStatus>,
}

impl RunningApp {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn announcement_path(&self) -> &Path {
        &self.announcement_path
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Starts turning control signals into shutdown requests.
    pub fn forward_signals(&self, signals: ControlSignals) -> JoinHandle<()> {
        signals.forward(self.shutdown.clone())
    }

    /// Waits for the coordinator to finish the exit protocol.
    pub async fn wait(self) -> ExitStatus {
        match self.coordinator.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "shutdown coordinator failed");
                ExitStatus::Abnormal
            }
        }
    }
}

fn abandon(mut catalog: SessionCatalog, id: SessionId, error: &StartupError) {
    tracing::error!(session = %id, %error, "session failed to start");
    if let Err(e) = catalog.finish_session(id, SessionStatus::Aborted, None) {
        tracing::warn!(error = %e, "failed to record session status");
    }
    if let Err(e) = catalog.disconnect() {
        tracing::warn!(error = %e, "failed to close status connection");
    }
}

/// Host name modules should use to reach the listener.
fn advertised_host(configured: Option<&str>, bound: IpAddr) -> String {
    if let Some(host) = configured {
        return host.to_string();
    }
    if bound.is_unspecified()
        && let Some(name) = nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
    {
        return name;
    }
    bound.to_string()
}

fn remove_announcement(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "announcement removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove announcement"),
    }
}

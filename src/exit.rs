//! Session exit protocol.
//!
//! Runs exactly once per process, after the acceptor has stopped, along the
//! path chosen by the terminal shutdown state:
//!
//! ```text
//! commit:  delete transients -> put data units -> detach log -> put log unit
//!          -> status committed -> stop SUMS -> close status db
//!          -> COMMIT -> disconnect -> release
//!
//! abort:   ROLLBACK -> detach log -> put log unit -> status aborted
//!          -> close SUMS queues -> close status db -> disconnect(abort)
//!          -> grace sleep -> release
//! ```

mod error;

pub use error::ExitError;

use std::sync::Arc;
use std::time::Duration;

use crate::db::{DbError, SessionCatalog, SessionStatus, SharedTransaction, TransactionState};
use crate::logging::SessionLog;
use crate::session::{Session, StoragePolicy, WorkerId};
use crate::shutdown::ShutdownState;
use crate::sums::{StorageUnit, SumsDispatcher, SumsError, SumsQueue, SumsReply, SumsRequest, Sunum};

/// Process exit status produced by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Committed,
    Aborted,
    /// The acceptor or the coordinator itself failed.
    Abnormal,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Committed => 0,
            ExitStatus::Aborted => 1,
            ExitStatus::Abnormal => 2,
        }
    }
}

/// The running storage subsystem: its queues and the dispatcher task.
pub struct SumsRuntime {
    pub queue: Arc<SumsQueue>,
    pub dispatcher: SumsDispatcher,
}

/// Timing knobs of the exit protocol.
#[derive(Debug, Clone, Copy)]
pub struct ExitOptions {
    /// Pause at the end of the abort path.
    pub abort_grace: Duration,
    /// Bound on each SUMS call made during exit.
    pub sums_timeout: Duration,
}

impl Default for ExitOptions {
    fn default() -> Self {
        Self {
            abort_grace: Duration::from_secs(1),
            sums_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the exit protocol tears down.
pub struct ExitProtocol {
    session: Arc<Session>,
    catalog: SessionCatalog,
    sums: Option<SumsRuntime>,
    log: SessionLog,
    options: ExitOptions,
}

impl ExitProtocol {
    pub fn new(session: Arc<Session>, catalog: SessionCatalog, log: SessionLog) -> Self {
        Self {
            session,
            catalog,
            sums: None,
            log,
            options: ExitOptions::default(),
        }
    }

    pub fn with_sums(mut self, sums: SumsRuntime) -> Self {
        self.sums = Some(sums);
        self
    }

    pub fn with_options(mut self, options: ExitOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs the exit path for `state` and returns the process exit status.
    pub async fn run(self, state: ShutdownState) -> ExitStatus {
        let session = self.session.id();
        if !state.commits() {
            tracing::info!(%session, %state, "aborting session");
            return self.abort().await;
        }

        match with_tx(&self.session, |tx| Ok(tx.state())).await {
            Ok(TransactionState::Active) => {
                tracing::info!(%session, %state, "committing session");
                self.commit().await
            }
            Ok(tx_state) => {
                tracing::warn!(%session, ?tx_state, "shared transaction cannot commit, aborting instead");
                self.abort().await
            }
            Err(e) => {
                tracing::error!(%session, error = %e, "cannot inspect shared transaction, aborting");
                self.abort().await
            }
        }
    }

    async fn commit(mut self) -> ExitStatus {
        let id = self.session.id();
        let queue = self.queue();
        let timeout = self.options.sums_timeout;

        match with_tx(&self.session, move |tx| tx.delete_transient(id)).await {
            Ok(rows) => tracing::debug!(rows, "transient records deleted"),
            Err(e) => tracing::error!(error = %e, "failed to delete transient records"),
        }

        let policy = self.session.policy();
        for unit in self.session.take_units() {
            if let Err(e) = store(queue.as_deref(), unit.sunum, policy, timeout).await {
                tracing::error!(sunum = %unit.sunum, error = %e, "failed to commit data unit");
            }
        }

        let log_sunum = close_log(&self.log, &self.session, queue.as_deref(), timeout).await;

        if let Err(e) = self
            .catalog
            .finish_session(id, SessionStatus::Committed, log_sunum)
        {
            tracing::error!(error = %e, "failed to record session status");
        }

        if let Some(sums) = self.sums.take()
            && let Err(e) = sums.dispatcher.finish(&sums.queue).await
        {
            tracing::error!(error = %e, "SUMS dispatcher did not stop cleanly");
        }

        if let Err(e) = self.catalog.disconnect() {
            tracing::warn!(error = %e, "failed to close status connection");
        }

        let status = match with_tx(&self.session, |tx| tx.commit()).await {
            Ok(()) => {
                tracing::info!(session = %id, "shared transaction committed");
                ExitStatus::Committed
            }
            Err(e) => {
                tracing::error!(session = %id, error = %e, "commit failed, rolling back");
                if let Err(e) = with_tx(&self.session, |tx| tx.rollback()).await {
                    tracing::error!(error = %e, "rollback after failed commit failed");
                }
                ExitStatus::Aborted
            }
        };

        if let Err(e) = with_tx(&self.session, move |tx| {
            tx.disconnect(status != ExitStatus::Committed)
        })
        .await
        {
            tracing::warn!(error = %e, "failed to close database connection");
        }

        self.session.release();
        status
    }

    async fn abort(mut self) -> ExitStatus {
        let id = self.session.id();
        let queue = self.queue();

        match with_tx(&self.session, |tx| tx.rollback()).await {
            Ok(()) => tracing::info!(session = %id, "shared transaction rolled back"),
            Err(e) => tracing::error!(session = %id, error = %e, "rollback failed"),
        }

        // Blocked workers are only released once the queues close, so the
        // log unit gets no longer than the grace period.
        let timeout = self.options.sums_timeout.min(self.options.abort_grace);
        let log_sunum = close_log(&self.log, &self.session, queue.as_deref(), timeout).await;
        if let Err(e) = self
            .catalog
            .finish_session(id, SessionStatus::Aborted, log_sunum)
        {
            tracing::error!(error = %e, "failed to record session status");
        }

        if let Some(sums) = self.sums.take() {
            sums.queue.close();
            tracing::debug!(
                requests = sums.queue.pending_requests(),
                replies = sums.queue.pending_replies(),
                "SUMS queues closed"
            );
        }

        if let Err(e) = self.catalog.disconnect() {
            tracing::warn!(error = %e, "failed to close status connection");
        }
        if let Err(e) = with_tx(&self.session, |tx| tx.disconnect(true)).await {
            tracing::warn!(error = %e, "failed to close database connection");
        }

        tokio::time::sleep(self.options.abort_grace).await;
        self.session.release();
        ExitStatus::Aborted
    }

    fn queue(&self) -> Option<Arc<SumsQueue>> {
        self.sums.as_ref().map(|sums| Arc::clone(&sums.queue))
    }
}

/// Flushes and detaches the session log, then commits the log unit.
async fn close_log(
    log: &SessionLog,
    session: &Session,
    queue: Option<&SumsQueue>,
    timeout: Duration,
) -> Option<Sunum> {
    if let Err(e) = log.detach() {
        tracing::warn!(error = %e, "failed to flush session log");
    }
    let StorageUnit { sunum, .. } = session.log_unit()?;
    match store(queue, sunum, session.policy(), timeout).await {
        Ok(()) => Some(sunum),
        Err(e) => {
            tracing::error!(%sunum, error = %e, "failed to commit log unit");
            None
        }
    }
}

/// Sends a `Put` for `sunum` on the session's own tag and checks that the
/// reply is for the same unit.
async fn store(
    queue: Option<&SumsQueue>,
    sunum: Sunum,
    policy: StoragePolicy,
    timeout: Duration,
) -> Result<(), ExitError> {
    let queue = queue.ok_or(SumsError::Unavailable)?;
    let request = SumsRequest::Put {
        sunum,
        retention_days: policy.retention_days,
        archive: policy.archive,
    };
    match queue.call(WorkerId::SESSION, request, timeout).await? {
        SumsReply::Stored { sunum: stored } if stored == sunum => Ok(()),
        SumsReply::Failed { reason } => Err(SumsError::Failed(reason).into()),
        other => Err(SumsError::UnexpectedReply(other).into()),
    }
}

/// Runs `f` on the shared transaction from the blocking pool.
async fn with_tx<T, F>(session: &Arc<Session>, f: F) -> Result<T, ExitError>
where
    T: Send + 'static,
    F: FnOnce(&mut SharedTransaction) -> Result<T, DbError> + Send + 'static,
{
    let session = Arc::clone(session);
    Ok(tokio::task::spawn_blocking(move || session.with_transaction(f)).await??)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{Journal, JournalConnection};
    use crate::db::{IsolationLevel, Participation, SqliteConnection};
    use crate::session::SessionId;
    use crate::sums::{DirSums, UnitKind};

    fn session(journal: &Journal) -> Arc<Session> {
        let mut tx = SharedTransaction::new(Box::new(JournalConnection::new(journal.clone())));
        tx.begin(Some(IsolationLevel::Serializable)).unwrap();
        Arc::new(Session::new(
            SessionId::new(1),
            tx,
            StoragePolicy::default(),
            Some(IsolationLevel::Serializable),
        ))
    }

    fn catalog() -> SessionCatalog {
        SessionCatalog::open(Box::new(SqliteConnection::open_in_memory().unwrap())).unwrap()
    }

    fn quick() -> ExitOptions {
        ExitOptions {
            abort_grace: Duration::from_millis(1),
            sums_timeout: Duration::from_secs(5),
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_exit_future_is_send() {
        let journal = Journal::default();
        let exit = ExitProtocol::new(session(&journal), catalog(), SessionLog::new());
        let future = exit.run(ShutdownState::CommitRequested);
        assert_send(&future);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_before_disconnect() {
        let journal = Journal::default();
        let session = session(&journal);
        let exit = ExitProtocol::new(Arc::clone(&session), catalog(), SessionLog::new())
            .with_options(quick());

        let status = exit.run(ShutdownState::AbortRequested).await;

        assert_eq!(status, ExitStatus::Aborted);
        assert_eq!(status.code(), 1);
        let rollback = journal.position("db:rollback").unwrap();
        let disconnect = journal.position("db:disconnect abort=true").unwrap();
        assert!(rollback < disconnect);
        assert!(journal.position("db:commit").is_none());
        assert!(session.is_released());
    }

    #[tokio::test]
    async fn test_commit_is_last_database_operation() {
        let journal = Journal::default();
        let session = session(&journal);
        let exit = ExitProtocol::new(Arc::clone(&session), catalog(), SessionLog::new())
            .with_options(quick());

        let status = exit.run(ShutdownState::CommitRequested).await;

        assert_eq!(status, ExitStatus::Committed);
        let events = journal.events();
        let delete = journal.position("db:execute DELETE FROM drms_transient").unwrap();
        let commit = journal.position("db:commit").unwrap();
        assert!(delete < commit);
        assert_eq!(events.last().unwrap(), "db:disconnect abort=false");
        assert!(journal.position("db:rollback").is_none());
    }

    #[tokio::test]
    async fn test_main_driven_takes_commit_path() {
        let journal = Journal::default();
        let session = session(&journal);
        let exit = ExitProtocol::new(session, catalog(), SessionLog::new()).with_options(quick());
        assert_eq!(exit.run(ShutdownState::MainDriven).await, ExitStatus::Committed);
        assert!(journal.position("db:commit").is_some());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let journal = Journal::default();
        journal.fail_commits();
        let session = session(&journal);
        let exit = ExitProtocol::new(session, catalog(), SessionLog::new()).with_options(quick());

        assert_eq!(exit.run(ShutdownState::CommitRequested).await, ExitStatus::Aborted);
        let commit = journal.position("db:commit").unwrap();
        let rollback = journal.position("db:rollback").unwrap();
        assert!(commit < rollback);
        assert!(journal.position("db:disconnect abort=true").is_some());
    }

    #[tokio::test]
    async fn test_poisoned_transaction_aborts_on_commit_request() {
        let journal = Journal::default();
        let session = session(&journal);
        let worker = WorkerId::new(1);
        session
            .with_transaction(|tx| tx.execute(worker, "UPDATE t SET FAIL = 1", Participation::Shared))
            .unwrap_err();

        let exit = ExitProtocol::new(session, catalog(), SessionLog::new()).with_options(quick());
        assert_eq!(exit.run(ShutdownState::CommitRequested).await, ExitStatus::Aborted);
        assert!(journal.position("db:commit").is_none());
        assert!(journal.position("db:rollback").is_some());
    }

    #[tokio::test]
    async fn test_commit_puts_units_and_log() {
        let journal = Journal::default();
        let session = session(&journal);
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SumsQueue::new());
        let dispatcher = SumsDispatcher::spawn(
            Arc::clone(&queue),
            Box::new(DirSums::open(dir.path()).unwrap()),
        );

        let mut units = Vec::new();
        for kind in [UnitKind::Log, UnitKind::Data] {
            let reply = queue
                .call(WorkerId::SESSION, SumsRequest::Alloc { bytes: 0 }, Duration::from_secs(5))
                .await
                .unwrap();
            let SumsReply::Allocated { sunum, path } = reply else {
                panic!("unexpected reply {reply:?}");
            };
            units.push(path.clone());
            let unit = StorageUnit { sunum, path, kind };
            match kind {
                UnitKind::Log => session.set_log_unit(unit),
                UnitKind::Data => session.add_unit(unit),
            }
        }

        let log = SessionLog::new();
        log.attach(&units[0]).unwrap();

        let exit = ExitProtocol::new(Arc::clone(&session), catalog(), log.clone())
            .with_sums(SumsRuntime {
                queue: Arc::clone(&queue),
                dispatcher,
            })
            .with_options(quick());
        assert_eq!(exit.run(ShutdownState::CommitRequested).await, ExitStatus::Committed);

        for path in &units {
            assert!(path.join(".retention").is_file(), "{} not committed", path.display());
        }
        assert!(!log.is_attached());
        assert_eq!(session.outstanding_units(), 0);
    }

    #[tokio::test]
    async fn test_abort_closes_sums_queues() {
        let journal = Journal::default();
        let session = session(&journal);
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SumsQueue::new());
        let dispatcher = SumsDispatcher::spawn(
            Arc::clone(&queue),
            Box::new(DirSums::open(dir.path()).unwrap()),
        );

        // A worker waiting on a reply that will never be produced.
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_reply(WorkerId::new(4)).await })
        };

        let exit = ExitProtocol::new(session, catalog(), SessionLog::new())
            .with_sums(SumsRuntime {
                queue: Arc::clone(&queue),
                dispatcher,
            })
            .with_options(quick());
        assert_eq!(exit.run(ShutdownState::AbortRequested).await, ExitStatus::Aborted);

        let released = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(released.is_err());
        assert!(queue.is_closed());
    }

    /// Allocates a log unit and leaves a worker's reply uncollected at the
    /// head of the outbox.
    async fn stalled_outbox(session: &Session, root: &std::path::Path) -> SumsRuntime {
        let queue = Arc::new(SumsQueue::new());
        let dispatcher =
            SumsDispatcher::spawn(Arc::clone(&queue), Box::new(DirSums::open(root).unwrap()));
        let reply = queue
            .call(WorkerId::SESSION, SumsRequest::Alloc { bytes: 0 }, Duration::from_secs(5))
            .await
            .unwrap();
        let SumsReply::Allocated { sunum, path } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        session.set_log_unit(StorageUnit {
            sunum,
            path,
            kind: UnitKind::Log,
        });

        queue
            .submit(WorkerId::new(4), SumsRequest::Alloc { bytes: 0 })
            .unwrap();
        while queue.pending_replies() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        SumsRuntime { queue, dispatcher }
    }

    #[tokio::test]
    async fn test_abort_does_not_wait_out_sums_timeout() {
        let journal = Journal::default();
        let session = session(&journal);
        let dir = tempfile::tempdir().unwrap();
        let sums = stalled_outbox(&session, dir.path()).await;
        let queue = Arc::clone(&sums.queue);

        let exit = ExitProtocol::new(session, catalog(), SessionLog::new())
            .with_sums(sums)
            .with_options(ExitOptions {
                abort_grace: Duration::from_millis(50),
                sums_timeout: Duration::from_secs(30),
            });
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            exit.run(ShutdownState::AbortRequested),
        )
        .await
        .expect("abort waited for the full SUMS timeout");
        assert_eq!(status, ExitStatus::Aborted);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_mismatched_store_reply_is_rejected() {
        let queue = SumsQueue::new();
        let responder = async {
            let (tag, ticket, _) = queue.next_request().await.unwrap();
            queue
                .reply(tag, ticket, SumsReply::Stored { sunum: Sunum::new(99) })
                .unwrap();
        };
        let (stored, ()) = tokio::join!(
            store(Some(&queue), Sunum::new(1), StoragePolicy::default(), Duration::from_secs(5)),
            responder
        );
        assert!(matches!(
            stored,
            Err(ExitError::Sums(SumsError::UnexpectedReply(SumsReply::Stored { .. })))
        ));
    }
}

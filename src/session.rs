//! The process-wide session record shared by every server component.
//!
//! A [`Session`] is constructed once by the startup routine and handed to the
//! acceptor, the workers and the exit protocol as an `Arc<Session>`. It owns
//! the shared database transaction and the client counter, both behind one
//! mutex, so that admitting a client and deciding to stop waiting for clients
//! are serialized against each other.
//!
//! ```text
//!   Acceptor ---- admit_client() ----+
//!                                    v
//!   Worker ----- with_transaction() -> +-----------------------------+
//!   (ClientSlot)                       | Mutex<SessionInner>          |
//!        | drop -> release_client() -> |  tx, client_count, units ... |
//!                                      +-----------------------------+
//!   Exit protocol -- take_units(), with_transaction(commit), release()
//! ```
//!
//! The shutdown state is deliberately *not* part of this record; it lives in
//! the coordinator's watch channel and no code path holds both at once.

mod error;
mod types;

pub use error::SessionError;
pub use types::{Endpoint, SessionId, StoragePolicy, WorkerId};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::db::{IsolationLevel, SharedTransaction};
use crate::sums::StorageUnit;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Mutable session state guarded by the session mutex.
struct SessionInner {
    tx: SharedTransaction,
    client_count: usize,
    next_worker: u32,
    admissions_open: bool,
    /// Data units allocated during the session and not yet committed.
    units: Vec<StorageUnit>,
    log_unit: Option<StorageUnit>,
}

/// The shared session record.
pub struct Session {
    id: SessionId,
    policy: StoragePolicy,
    /// `None` when session-level no-share was requested.
    isolation: Option<IsolationLevel>,
    endpoint: OnceLock<Endpoint>,
    inner: Mutex<SessionInner>,
    /// Signalled every time a client slot is released.
    drained: Notify,
    cleanups: Mutex<Vec<Cleanup>>,
    released: AtomicBool,
}

impl Session {
    /// Creates the session record around an (unstarted) shared transaction.
    pub fn new(
        id: SessionId,
        tx: SharedTransaction,
        policy: StoragePolicy,
        isolation: Option<IsolationLevel>,
    ) -> Self {
        Self {
            id,
            policy,
            isolation,
            endpoint: OnceLock::new(),
            inner: Mutex::new(SessionInner {
                tx,
                client_count: 0,
                next_worker: 1,
                admissions_open: true,
                units: Vec::new(),
                log_unit: None,
            }),
            drained: Notify::new(),
            cleanups: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    /// Isolation level requested for the shared transaction, or `None` when
    /// the session opted out of the shared serializable transaction.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// Records the listener endpoint. Only the first call has an effect.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        let _ = self.endpoint.set(endpoint);
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.get()
    }

    /// Admits a newly authenticated client.
    ///
    /// Increments the client counter under the session mutex and returns a
    /// [`ClientSlot`] that gives the count back when dropped.
    pub fn admit_client(self: &Arc<Self>) -> Result<ClientSlot, SessionError> {
        if self.is_released() {
            return Err(SessionError::Released);
        }
        let worker = {
            let mut inner = self.inner.lock();
            if !inner.admissions_open {
                return Err(SessionError::AdmissionsClosed);
            }
            let worker = WorkerId::new(inner.next_worker);
            inner.next_worker += 1;
            inner.client_count += 1;
            worker
        };
        Ok(ClientSlot {
            session: Arc::clone(self),
            worker,
        })
    }

    fn release_client(&self, worker: WorkerId) {
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.client_count > 0, "client count underflow");
            inner.client_count = inner.client_count.saturating_sub(1);
            tracing::debug!(worker = %worker, clients = inner.client_count, "client released");
        }
        self.drained.notify_waiters();
    }

    /// Number of workers currently servicing a connection.
    pub fn client_count(&self) -> usize {
        self.inner.lock().client_count
    }

    /// Stops admitting clients and returns the number still active.
    pub fn close_admissions(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.admissions_open = false;
        inner.client_count
    }

    pub fn admissions_open(&self) -> bool {
        self.inner.lock().admissions_open
    }

    /// Waits until every admitted client has been released.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.client_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Runs `f` against the shared transaction while holding the session
    /// mutex.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&mut SharedTransaction) -> T) -> T {
        let mut inner = self.inner.lock();
        f(&mut inner.tx)
    }

    /// Registers a data unit allocated during this session.
    pub fn add_unit(&self, unit: StorageUnit) {
        self.inner.lock().units.push(unit);
    }

    /// Removes and returns all outstanding data units.
    pub fn take_units(&self) -> Vec<StorageUnit> {
        std::mem::take(&mut self.inner.lock().units)
    }

    pub fn outstanding_units(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn set_log_unit(&self, unit: StorageUnit) {
        self.inner.lock().log_unit = Some(unit);
    }

    pub fn log_unit(&self) -> Option<StorageUnit> {
        self.inner.lock().log_unit.clone()
    }

    /// Registers a callback that runs once when the session is released.
    ///
    /// Callbacks run in registration order.
    pub fn on_release(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.lock().push(Box::new(cleanup));
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the session and runs the cleanup callbacks.
    ///
    /// Returns `false` (and does nothing) if the session was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.lock().admissions_open = false;
        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
        tracing::debug!(session = %self.id, "session released");
        true
    }
}

/// One admitted client's share of the client counter.
///
/// Dropping the slot decrements the counter under the session mutex.
pub struct ClientSlot {
    session: Arc<Session>,
    worker: WorkerId,
}

impl ClientSlot {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.session.release_client(self.worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{Journal, JournalConnection};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_session() -> Arc<Session> {
        let conn = JournalConnection::new(Journal::default());
        Arc::new(Session::new(
            SessionId::new(1),
            SharedTransaction::new(Box::new(conn)),
            StoragePolicy::default(),
            Some(IsolationLevel::Serializable),
        ))
    }

    #[test]
    fn test_admit_assigns_sequential_workers() {
        let session = test_session();
        let a = session.admit_client().unwrap();
        let b = session.admit_client().unwrap();
        assert_eq!(a.worker(), WorkerId::new(1));
        assert_eq!(b.worker(), WorkerId::new(2));
        assert_eq!(session.client_count(), 2);
    }

    #[test]
    fn test_slot_drop_decrements() {
        let session = test_session();
        let a = session.admit_client().unwrap();
        let b = session.admit_client().unwrap();
        drop(a);
        assert_eq!(session.client_count(), 1);
        drop(b);
        assert_eq!(session.client_count(), 0);
    }

    #[test]
    fn test_close_admissions_refuses_clients() {
        let session = test_session();
        let _a = session.admit_client().unwrap();
        assert_eq!(session.close_admissions(), 1);
        assert_eq!(
            session.admit_client().err(),
            Some(SessionError::AdmissionsClosed)
        );
        assert_eq!(session.client_count(), 1);
    }

    #[test]
    fn test_concurrent_admissions_balance() {
        let session = test_session();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let slot = session.admit_client().unwrap();
                        assert!(session.client_count() >= 1);
                        drop(slot);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(session.client_count(), 0);
        // 800 admissions were numbered without reuse.
        assert_eq!(session.admit_client().unwrap().worker(), WorkerId::new(801));
    }

    #[tokio::test]
    async fn test_wait_for_drain_returns_after_last_release() {
        let session = test_session();
        let slot = session.admit_client().unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait_for_drain().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_drain_without_clients() {
        let session = test_session();
        tokio::time::timeout(Duration::from_millis(100), session.wait_for_drain())
            .await
            .expect("no clients means no wait");
    }

    #[test]
    fn test_release_runs_cleanups_once() {
        let session = test_session();
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            session.on_release(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(session.release());
        assert!(!session.release());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(session.admit_client().err(), Some(SessionError::Released));
    }

    #[test]
    fn test_units_are_taken_once() {
        use crate::sums::{Sunum, UnitKind};
        use std::path::PathBuf;

        let session = test_session();
        session.add_unit(StorageUnit {
            sunum: Sunum::new(7),
            path: PathBuf::from("/tmp/D7"),
            kind: UnitKind::Data,
        });
        assert_eq!(session.outstanding_units(), 1);
        assert_eq!(session.take_units().len(), 1);
        assert!(session.take_units().is_empty());
    }
}

//! The single transaction shared by every client worker.

use super::driver::{DbConnection, IsolationLevel, QueryResult};
use super::error::DbError;
use crate::session::{SessionId, WorkerId};

/// Statements executed before the transaction begins.
const SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS drms_transient ( \
        session_id INTEGER NOT NULL, \
        series TEXT NOT NULL, \
        recnum INTEGER NOT NULL \
    )"];

/// Leading keywords clients may not issue against the shared transaction.
const CONTROL_KEYWORDS: &[&str] = &[
    "BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE",
];

/// Lifecycle of the shared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not yet begun.
    Idle,
    Active,
    /// A shared statement failed; only rollback remains meaningful.
    Failed,
    Committed,
    RolledBack,
}

/// How a worker's statement takes part in the shared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Participation {
    /// A failure poisons the whole shared transaction.
    Shared,
    /// The statement runs under its own savepoint; a failure is rolled back
    /// to that savepoint and the shared transaction stays usable.
    Isolated,
}

impl Participation {
    pub fn from_no_share(no_share: bool) -> Self {
        if no_share {
            Participation::Isolated
        } else {
            Participation::Shared
        }
    }
}

/// The shared transaction and the connection it runs on.
///
/// Only the exit protocol calls [`commit`](Self::commit) and
/// [`rollback`](Self::rollback); workers go through
/// [`execute`](Self::execute), which refuses transaction-control statements.
pub struct SharedTransaction {
    conn: Box<dyn DbConnection>,
    state: TransactionState,
    connected: bool,
}

impl SharedTransaction {
    pub fn new(conn: Box<dyn DbConnection>) -> Self {
        Self {
            conn,
            state: TransactionState::Idle,
            connected: true,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Creates the session tables this server relies on.
    pub fn bootstrap(&mut self) -> Result<(), DbError> {
        for statement in SCHEMA {
            self.conn.execute(statement)?;
        }
        Ok(())
    }

    /// Begins the shared transaction.
    ///
    /// With `Some(level)` the isolation level is set first; `None` leaves the
    /// backend default in place (session-level no-share).
    pub fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<(), DbError> {
        if self.state != TransactionState::Idle {
            return Err(DbError::NotActive(self.state));
        }
        if let Some(level) = isolation {
            self.conn.set_isolation(level)?;
        }
        self.conn.begin()?;
        self.state = TransactionState::Active;
        Ok(())
    }

    /// Executes a worker's statement inside the shared transaction.
    pub fn execute(
        &mut self,
        worker: WorkerId,
        sql: &str,
        participation: Participation,
    ) -> Result<QueryResult, DbError> {
        if let Some(keyword) = transaction_control_keyword(sql) {
            return Err(DbError::TransactionControl(keyword));
        }
        self.ensure_active()?;

        let result = match participation {
            Participation::Shared => self.conn.execute(sql).inspect_err(|_| {
                self.state = TransactionState::Failed;
            }),
            Participation::Isolated => self.execute_isolated(worker, sql),
        };
        if !self.conn.in_transaction() {
            // Anything run from here on would autocommit.
            tracing::warn!(worker = %worker, "backend ended the shared transaction");
            self.state = TransactionState::Failed;
            return Err(DbError::TransactionEnded);
        }
        result
    }

    fn execute_isolated(&mut self, worker: WorkerId, sql: &str) -> Result<QueryResult, DbError> {
        let savepoint = format!("drms_w{}", worker.get());
        self.savepoint_step(&format!("SAVEPOINT {savepoint}"))?;
        match self.conn.execute(sql) {
            Ok(result) => {
                self.savepoint_step(&format!("RELEASE SAVEPOINT {savepoint}"))?;
                Ok(result)
            }
            Err(e) => {
                self.savepoint_step(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))?;
                self.savepoint_step(&format!("RELEASE SAVEPOINT {savepoint}"))?;
                Err(e)
            }
        }
    }

    /// Savepoint bookkeeping that fails leaves the transaction in an unknown
    /// state, so it poisons the whole transaction.
    fn savepoint_step(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute(sql).map(|_| ()).inspect_err(|_| {
            self.state = TransactionState::Failed;
        })
    }

    fn ensure_active(&self) -> Result<(), DbError> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Failed => Err(DbError::TransactionAborted),
            other => Err(DbError::NotActive(other)),
        }
    }

    /// Records a transient record owned by `session`.
    pub fn mark_transient(
        &mut self,
        worker: WorkerId,
        session: SessionId,
        series: &str,
        recnum: i64,
        participation: Participation,
    ) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO drms_transient (session_id, series, recnum) VALUES ({}, {}, {})",
            session.get(),
            quote_literal(series),
            recnum
        );
        self.execute(worker, &sql, participation).map(|_| ())
    }

    /// Deletes every transient record owned by `session`.
    pub fn delete_transient(&mut self, session: SessionId) -> Result<u64, DbError> {
        self.ensure_active()?;
        let sql = format!(
            "DELETE FROM drms_transient WHERE session_id = {}",
            session.get()
        );
        match self.conn.execute(&sql)? {
            QueryResult::Command { rows, .. } => Ok(rows),
            QueryResult::Rows { .. } => Err(DbError::UnexpectedResult("rows from DELETE")),
        }
    }

    /// Commits the shared transaction.
    ///
    /// A failed transaction cannot be committed; the caller must roll back.
    pub fn commit(&mut self) -> Result<(), DbError> {
        self.ensure_active()?;
        match self.conn.commit() {
            Ok(()) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    /// Rolls back the shared transaction. Rolling back twice is a no-op.
    pub fn rollback(&mut self) -> Result<(), DbError> {
        match self.state {
            TransactionState::Active | TransactionState::Failed => {
                self.state = TransactionState::RolledBack;
                self.conn.rollback()
            }
            TransactionState::Idle => {
                self.state = TransactionState::RolledBack;
                Ok(())
            }
            TransactionState::RolledBack => Ok(()),
            TransactionState::Committed => Err(DbError::NotActive(self.state)),
        }
    }

    /// Closes the connection. Disconnecting twice is a no-op.
    pub fn disconnect(&mut self, abort: bool) -> Result<(), DbError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.conn.disconnect(abort)
    }
}

fn transaction_control_keyword(sql: &str) -> Option<String> {
    let first: String = skip_leading_noise(sql)
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();
    CONTROL_KEYWORDS
        .contains(&first.as_str())
        .then_some(first)
}

/// Skips whitespace, empty statements and comments ahead of the first token.
fn skip_leading_noise(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start_matches(|c: char| c.is_whitespace() || c == ';');
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map_or("", |(_, line)| line);
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return sql;
        }
    }
}

/// Quotes a string as an SQL literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteConnection;
    use crate::db::tests::{Journal, JournalConnection};

    fn active(journal: &Journal) -> SharedTransaction {
        let mut tx = SharedTransaction::new(Box::new(JournalConnection::new(journal.clone())));
        tx.begin(Some(IsolationLevel::Serializable)).unwrap();
        tx
    }

    #[test]
    fn test_begin_sets_isolation_first() {
        let journal = Journal::default();
        let tx = active(&journal);
        assert_eq!(tx.state(), TransactionState::Active);
        assert_eq!(
            journal.events(),
            vec!["db:isolation Serializable", "db:begin"]
        );
    }

    #[test]
    fn test_begin_without_isolation() {
        let journal = Journal::default();
        let mut tx = SharedTransaction::new(Box::new(JournalConnection::new(journal.clone())));
        tx.begin(None).unwrap();
        assert_eq!(journal.events(), vec!["db:begin"]);
    }

    #[test]
    fn test_begin_twice_fails() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        assert!(matches!(
            tx.begin(None),
            Err(DbError::NotActive(TransactionState::Active))
        ));
    }

    #[test]
    fn test_transaction_control_rejected() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        for sql in ["COMMIT", "  rollback;", "begin transaction", "SAVEPOINT x", "end"] {
            let result = tx.execute(WorkerId::new(1), sql, Participation::Shared);
            assert!(
                matches!(result, Err(DbError::TransactionControl(_))),
                "{sql} should be rejected"
            );
        }
        assert_eq!(tx.state(), TransactionState::Active);
    }

    #[test]
    fn test_commented_transaction_control_rejected() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        for sql in [
            "/* x */ COMMIT",
            "-- c\nROLLBACK",
            "COMMIT--x",
            ";/* a */ /* b */\n\tend/**/",
            "--only a comment",
        ] {
            let result = tx.execute(WorkerId::new(1), sql, Participation::Shared);
            if sql.starts_with("--only") {
                assert!(result.is_ok(), "{sql} should reach the backend");
                continue;
            }
            assert!(
                matches!(result, Err(DbError::TransactionControl(_))),
                "{sql} should be rejected"
            );
        }
        assert_eq!(tx.state(), TransactionState::Active);
        assert!(journal.position("db:execute /*").is_none());
    }

    #[test]
    fn test_keyword_needs_whole_word() {
        assert_eq!(transaction_control_keyword("ENDPOINTS"), None);
        assert_eq!(transaction_control_keyword("select 1"), None);
        assert_eq!(
            transaction_control_keyword("/* unterminated"),
            None
        );
        assert_eq!(
            transaction_control_keyword("Release sp1"),
            Some("RELEASE".to_string())
        );
    }

    #[test]
    fn test_backend_leaving_transaction_fails_it() {
        let journal = Journal::default();
        let mut tx = active(&journal);

        let result = tx.execute(WorkerId::new(1), "SELECT LEAVE", Participation::Shared);
        assert!(matches!(result, Err(DbError::TransactionEnded)));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert!(matches!(
            tx.execute(WorkerId::new(2), "SELECT 1", Participation::Isolated),
            Err(DbError::TransactionAborted)
        ));
        assert!(matches!(tx.commit(), Err(DbError::TransactionAborted)));
    }

    #[test]
    fn test_commented_commit_against_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drms.db");
        let mut setup = SqliteConnection::open(&path).unwrap();
        setup.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();

        let mut tx = SharedTransaction::new(Box::new(SqliteConnection::open(&path).unwrap()));
        tx.begin(None).unwrap();
        let worker = WorkerId::new(1);
        tx.execute(worker, "INSERT INTO t VALUES (1)", Participation::Shared)
            .unwrap();
        assert!(matches!(
            tx.execute(worker, "/* x */ COMMIT", Participation::Shared),
            Err(DbError::TransactionControl(_))
        ));

        // Nothing is visible outside the transaction until the session commits.
        assert!(matches!(
            setup.execute("SELECT count(*) FROM t").unwrap(),
            QueryResult::Rows { rows, .. } if rows[0][0].as_deref() == Some("0")
        ));
        tx.commit().unwrap();
        assert!(matches!(
            setup.execute("SELECT count(*) FROM t").unwrap(),
            QueryResult::Rows { rows, .. } if rows[0][0].as_deref() == Some("1")
        ));
    }

    #[test]
    fn test_sqlite_conflict_rollback_fails_transaction() {
        let mut tx = SharedTransaction::new(Box::new(SqliteConnection::open_in_memory().unwrap()));
        tx.bootstrap().unwrap();
        tx.begin(None).unwrap();
        let worker = WorkerId::new(1);
        tx.execute(worker, "CREATE TABLE t (id INTEGER PRIMARY KEY)", Participation::Shared)
            .unwrap();
        tx.execute(worker, "INSERT INTO t VALUES (1)", Participation::Shared)
            .unwrap();

        // The conflict clause rolls back the whole transaction, savepoint or not.
        let result = tx.execute(
            worker,
            "INSERT OR ROLLBACK INTO t VALUES (1)",
            Participation::Isolated,
        );
        assert!(matches!(result, Err(DbError::TransactionEnded)));
        assert_eq!(tx.state(), TransactionState::Failed);
        assert!(matches!(
            tx.execute(worker, "INSERT INTO t VALUES (2)", Participation::Shared),
            Err(DbError::TransactionAborted)
        ));
    }

    #[test]
    fn test_shared_failure_poisons_transaction() {
        let journal = Journal::default();
        let mut tx = active(&journal);

        let result = tx.execute(WorkerId::new(1), "INSERT FAIL", Participation::Shared);
        assert!(matches!(result, Err(DbError::Backend(_))));
        assert_eq!(tx.state(), TransactionState::Failed);

        let result = tx.execute(WorkerId::new(2), "SELECT 1", Participation::Shared);
        assert!(matches!(result, Err(DbError::TransactionAborted)));
        assert!(matches!(tx.commit(), Err(DbError::TransactionAborted)));
    }

    #[test]
    fn test_isolated_failure_rolls_back_to_savepoint() {
        let journal = Journal::default();
        let mut tx = active(&journal);

        let result = tx.execute(WorkerId::new(3), "INSERT FAIL", Participation::Isolated);
        assert!(result.is_err());
        assert_eq!(tx.state(), TransactionState::Active);

        let events = journal.events();
        assert_eq!(
            &events[2..],
            &[
                "db:execute SAVEPOINT drms_w3",
                "db:execute INSERT FAIL",
                "db:execute ROLLBACK TO SAVEPOINT drms_w3",
                "db:execute RELEASE SAVEPOINT drms_w3",
            ]
        );

        tx.execute(WorkerId::new(4), "SELECT 1", Participation::Shared)
            .unwrap();
    }

    #[test]
    fn test_commit_then_statements_refused() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert!(matches!(
            tx.execute(WorkerId::new(1), "SELECT 1", Participation::Shared),
            Err(DbError::NotActive(TransactionState::Committed))
        ));
        assert!(tx.rollback().is_err());
    }

    #[test]
    fn test_commit_failure_marks_failed() {
        let journal = Journal::default();
        journal.fail_commits();
        let mut tx = active(&journal);
        assert!(tx.commit().is_err());
        assert_eq!(tx.state(), TransactionState::Failed);
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_rollback_and_disconnect_are_idempotent() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        tx.rollback().unwrap();
        tx.rollback().unwrap();
        tx.disconnect(true).unwrap();
        tx.disconnect(true).unwrap();
        assert_eq!(
            journal.events(),
            vec![
                "db:isolation Serializable",
                "db:begin",
                "db:rollback",
                "db:disconnect abort=true",
            ]
        );
    }

    #[test]
    fn test_mark_transient_quotes_series() {
        let journal = Journal::default();
        let mut tx = active(&journal);
        tx.mark_transient(
            WorkerId::new(1),
            SessionId::new(9),
            "hmi.o'brien",
            42,
            Participation::Shared,
        )
        .unwrap();
        assert_eq!(
            journal.events().last().unwrap(),
            "db:execute INSERT INTO drms_transient (session_id, series, recnum) VALUES (9, 'hmi.o''brien', 42)"
        );
    }
}

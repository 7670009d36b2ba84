//! Database access for the session server.
//!
//! The relational backend is an external collaborator reached through the
//! [`DbConnection`] trait. The server holds two connections:
//!
//! ```text
//! +----------------------------------------------------------------+
//! |                          Session                               |
//! |   +--------------------------+                                 |
//! |   | SharedTransaction        |  one transaction shared by all  |
//! |   |  Box<dyn DbConnection>   |  workers, committed or rolled   |
//! |   +--------------------------+  back only by the exit protocol |
//! +----------------------------------------------------------------+
//!
//!     +--------------------------+
//!     | SessionCatalog           |  autocommit status connection
//!     |  Box<dyn DbConnection>   |  (drms_session table)
//!     +--------------------------+
//! ```
//!
//! [`SqliteConnection`] is the bundled backend.

mod catalog;
mod driver;
mod error;
mod sqlite;
mod transaction;

pub use catalog::{SessionCatalog, SessionStatus};
pub use driver::{DbConnection, IsolationLevel, QueryResult, command_tag};
pub use error::DbError;
pub use sqlite::SqliteConnection;
pub use transaction::{Participation, SharedTransaction, TransactionState};

/// Test helpers for database-layer tests used across multiple test modules.
#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Shared, ordered record of every call made on a [`JournalConnection`].
    #[derive(Clone, Default)]
    pub struct Journal {
        events: Arc<Mutex<Vec<String>>>,
        fail_commit: Arc<Mutex<bool>>,
    }

    impl Journal {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        pub fn push(&self, event: impl Into<String>) {
            self.events.lock().push(event.into());
        }

        /// Position of the first event starting with `prefix`.
        pub fn position(&self, prefix: &str) -> Option<usize> {
            self.events.lock().iter().position(|e| e.starts_with(prefix))
        }

        pub fn fail_commits(&self) {
            *self.fail_commit.lock() = true;
        }
    }

    /// Connection that records calls instead of talking to a backend.
    ///
    /// Statements containing `FAIL` return an error. Statements containing
    /// `LEAVE` end the open transaction the way a backend-side rollback would.
    pub struct JournalConnection {
        journal: Journal,
        label: &'static str,
        open: bool,
    }

    impl JournalConnection {
        pub fn new(journal: Journal) -> Self {
            Self::labelled(journal, "db")
        }

        pub fn labelled(journal: Journal, label: &'static str) -> Self {
            Self {
                journal,
                label,
                open: false,
            }
        }

        fn record(&self, event: impl std::fmt::Display) {
            self.journal.push(format!("{}:{}", self.label, event));
        }
    }

    impl DbConnection for JournalConnection {
        fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DbError> {
            self.record(format!("isolation {level:?}"));
            Ok(())
        }

        fn begin(&mut self) -> Result<(), DbError> {
            self.record("begin");
            self.open = true;
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DbError> {
            self.record("commit");
            if *self.journal.fail_commit.lock() {
                return Err(DbError::Backend("commit refused".to_string()));
            }
            self.open = false;
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), DbError> {
            self.record("rollback");
            self.open = false;
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            self.open
        }

        fn execute(&mut self, sql: &str) -> Result<QueryResult, DbError> {
            self.record(format!("execute {sql}"));
            if sql.contains("LEAVE") {
                self.open = false;
            }
            if sql.contains("FAIL") {
                return Err(DbError::Backend(format!("statement failed: {sql}")));
            }
            if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
                return Ok(QueryResult::Rows {
                    columns: vec!["value".to_string()],
                    rows: vec![vec![Some("1".to_string())]],
                });
            }
            Ok(QueryResult::Command {
                tag: command_tag(sql, 0),
                rows: 0,
            })
        }

        fn disconnect(&mut self, abort: bool) -> Result<(), DbError> {
            self.record(format!("disconnect abort={abort}"));
            Ok(())
        }
    }
}

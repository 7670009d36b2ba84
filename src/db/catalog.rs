//! Session status bookkeeping on a separate autocommit connection.
//!
//! The status connection lives outside the shared transaction so that the
//! final status of an aborted session is still recorded.

use super::driver::{DbConnection, QueryResult};
use super::error::DbError;
use super::transaction::quote_literal;
use crate::session::{Endpoint, SessionId};
use crate::sums::Sunum;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS drms_session ( \
        session_id INTEGER PRIMARY KEY AUTOINCREMENT, \
        username TEXT NOT NULL, \
        pid INTEGER NOT NULL, \
        host TEXT, \
        port INTEGER, \
        status TEXT NOT NULL, \
        log_sunum INTEGER, \
        started_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
        ended_at TEXT \
    )";

/// Recorded status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Committed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Committed => "committed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

/// The `drms_session` table, reached through the status connection.
pub struct SessionCatalog {
    conn: Box<dyn DbConnection>,
    connected: bool,
}

impl SessionCatalog {
    /// Wraps the status connection and creates the table if needed.
    pub fn open(mut conn: Box<dyn DbConnection>) -> Result<Self, DbError> {
        conn.execute(SCHEMA)?;
        Ok(Self {
            conn,
            connected: true,
        })
    }

    /// Inserts a `running` row for a new session and returns its id.
    pub fn start_session(&mut self, user: &str, pid: u32) -> Result<SessionId, DbError> {
        self.conn.execute(&format!(
            "INSERT INTO drms_session (username, pid, status) VALUES ({}, {}, {})",
            quote_literal(user),
            pid,
            quote_literal(SessionStatus::Running.as_str())
        ))?;
        match self.conn.execute("SELECT last_insert_rowid()")? {
            QueryResult::Rows { rows, .. } => rows
                .first()
                .and_then(|row| row.first())
                .and_then(|value| value.as_deref())
                .and_then(|value| value.parse().ok())
                .map(SessionId::new)
                .ok_or(DbError::UnexpectedResult("missing session id")),
            QueryResult::Command { .. } => Err(DbError::UnexpectedResult("no session id row")),
        }
    }

    /// Records where the session's listener can be reached.
    pub fn record_endpoint(&mut self, id: SessionId, endpoint: &Endpoint) -> Result<(), DbError> {
        self.conn.execute(&format!(
            "UPDATE drms_session SET host = {}, port = {} WHERE session_id = {}",
            quote_literal(&endpoint.host),
            endpoint.port,
            id.get()
        ))?;
        Ok(())
    }

    /// Records the final status of the session.
    pub fn finish_session(
        &mut self,
        id: SessionId,
        status: SessionStatus,
        log_sunum: Option<Sunum>,
    ) -> Result<(), DbError> {
        let log_sunum = log_sunum.map_or_else(|| "NULL".to_string(), |s| s.get().to_string());
        self.conn.execute(&format!(
            "UPDATE drms_session SET status = {}, log_sunum = {}, ended_at = CURRENT_TIMESTAMP \
             WHERE session_id = {}",
            quote_literal(status.as_str()),
            log_sunum,
            id.get()
        ))?;
        Ok(())
    }

    /// Reads back the recorded status of a session.
    pub fn status(&mut self, id: SessionId) -> Result<Option<String>, DbError> {
        match self.conn.execute(&format!(
            "SELECT status FROM drms_session WHERE session_id = {}",
            id.get()
        ))? {
            QueryResult::Rows { rows, .. } => {
                Ok(rows.into_iter().next().and_then(|row| row.into_iter().next().flatten()))
            }
            QueryResult::Command { .. } => Ok(None),
        }
    }

    /// Closes the status connection. Disconnecting twice is a no-op.
    pub fn disconnect(&mut self) -> Result<(), DbError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.conn.disconnect(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteConnection;

    fn catalog() -> SessionCatalog {
        SessionCatalog::open(Box::new(SqliteConnection::open_in_memory().unwrap())).unwrap()
    }

    #[test]
    fn test_session_ids_are_sequential() {
        let mut catalog = catalog();
        let first = catalog.start_session("production", 100).unwrap();
        let second = catalog.start_session("production", 101).unwrap();
        assert_eq!(second.get(), first.get() + 1);
        assert_eq!(catalog.status(first).unwrap().as_deref(), Some("running"));
    }

    #[test]
    fn test_finish_session_records_status() {
        let mut catalog = catalog();
        let id = catalog.start_session("o'neil", 100).unwrap();
        catalog
            .record_endpoint(
                id,
                &Endpoint {
                    host: "n02".to_string(),
                    port: 4242,
                },
            )
            .unwrap();
        catalog
            .finish_session(id, SessionStatus::Aborted, Some(Sunum::new(12)))
            .unwrap();
        assert_eq!(catalog.status(id).unwrap().as_deref(), Some("aborted"));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut catalog = catalog();
        catalog.disconnect().unwrap();
        catalog.disconnect().unwrap();
        assert!(catalog.start_session("x", 1).is_err());
    }
}

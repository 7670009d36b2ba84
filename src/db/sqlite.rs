//! SQLite backend.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::types::ValueRef;

use super::driver::{DbConnection, IsolationLevel, QueryResult, command_tag};
use super::error::DbError;

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`DbConnection`] backed by `rusqlite`.
pub struct SqliteConnection {
    conn: Option<Connection>,
}

impl SqliteConnection {
    /// Opens the database at `path`. The path `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn: Some(conn) })
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::open(Path::new(":memory:"))
    }

    fn conn(&mut self) -> Result<&mut Connection, DbError> {
        self.conn.as_mut().ok_or(DbError::Disconnected)
    }
}

impl DbConnection for SqliteConnection {
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DbError> {
        // SQLite transactions are serializable; read_uncommitted only relaxes
        // reads between connections sharing a cache.
        let pragma = match level {
            IsolationLevel::Serializable => "PRAGMA read_uncommitted = 0",
            IsolationLevel::ReadCommitted => "PRAGMA read_uncommitted = 1",
        };
        self.conn()?.execute_batch(pragma)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.conn()?.execute_batch("BEGIN DEFERRED")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.conn()?.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_autocommit())
    }

    fn execute(&mut self, sql: &str) -> Result<QueryResult, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();

        if column_count == 0 {
            let rows = stmt.execute([])?;
            return Ok(QueryResult::Command {
                tag: command_tag(sql, rows as u64),
                rows: rows as u64,
            });
        }

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut result = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(render_value(row.get_ref(i)?));
            }
            result.push(values);
        }
        Ok(QueryResult::Rows {
            columns,
            rows: result,
        })
    }

    fn disconnect(&mut self, abort: bool) -> Result<(), DbError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if abort && !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        conn.close().map_err(|(_, e)| DbError::Sqlite(e))
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(b.iter().fold(String::from("\\x"), |mut s, byte| {
            s.push_str(&format!("{byte:02x}"));
            s
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_command_and_rows() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let result = conn.execute("CREATE TABLE t (id INTEGER, name TEXT)").unwrap();
        assert_eq!(
            result,
            QueryResult::Command {
                tag: "CREATE TABLE".to_string(),
                rows: 0
            }
        );

        let result = conn
            .execute("INSERT INTO t VALUES (1, 'a'), (2, NULL)")
            .unwrap();
        assert_eq!(
            result,
            QueryResult::Command {
                tag: "INSERT 0 2".to_string(),
                rows: 2
            }
        );

        let result = conn.execute("SELECT id, name FROM t ORDER BY id").unwrap();
        assert_eq!(
            result,
            QueryResult::Rows {
                columns: vec!["id".to_string(), "name".to_string()],
                rows: vec![
                    vec![Some("1".to_string()), Some("a".to_string())],
                    vec![Some("2".to_string()), None],
                ],
            }
        );
    }

    #[test]
    fn test_blob_rendering() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let result = conn.execute("SELECT x'0aff'").unwrap();
        match result {
            QueryResult::Rows { rows, .. } => {
                assert_eq!(rows[0][0].as_deref(), Some("\\x0aff"));
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn test_rollback_discards_changes() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)").unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        conn.rollback().unwrap();

        let result = conn.execute("SELECT count(*) FROM t").unwrap();
        assert!(matches!(
            result,
            QueryResult::Rows { rows, .. } if rows[0][0].as_deref() == Some("0")
        ));
    }

    #[test]
    fn test_disconnect_with_abort_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drms.db");

        let mut conn = SqliteConnection::open(&path).unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)").unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO t VALUES (1)").unwrap();
        conn.disconnect(true).unwrap();
        assert!(matches!(conn.execute("SELECT 1"), Err(DbError::Disconnected)));

        let mut reopened = SqliteConnection::open(&path).unwrap();
        let result = reopened.execute("SELECT count(*) FROM t").unwrap();
        assert!(matches!(
            result,
            QueryResult::Rows { rows, .. } if rows[0][0].as_deref() == Some("0")
        ));
    }

    #[test]
    fn test_in_transaction_follows_backend() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        assert!(!conn.in_transaction());
        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.execute("COMMIT").unwrap();
        assert!(!conn.in_transaction());
        conn.disconnect(false).unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        assert!(matches!(
            conn.execute("SELEC 1"),
            Err(DbError::Sqlite(_))
        ));
    }
}

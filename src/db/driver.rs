//! Boundary to the relational backend.

use super::error::DbError;

/// Isolation level of the shared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    ReadCommitted,
}

/// Result of executing one SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// Statement completed without a result set.
    Command {
        /// Command completion tag (e.g. "INSERT 0 1", "CREATE TABLE").
        tag: String,
        /// Rows affected, when the backend reports it.
        rows: u64,
    },
    /// Statement returned rows. Values are rendered as text; `None` is NULL.
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
}

/// A connection to the relational backend.
///
/// Implementations are used from one thread at a time (the session mutex
/// serializes access), so only `Send` is required.
pub trait DbConnection: Send {
    fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), DbError>;

    fn begin(&mut self) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;

    /// Whether the backend has a transaction open on this connection.
    fn in_transaction(&self) -> bool;

    /// Executes a single SQL statement.
    fn execute(&mut self, sql: &str) -> Result<QueryResult, DbError>;

    /// Closes the connection. With `abort`, any open transaction is rolled
    /// back rather than left to the backend.
    fn disconnect(&mut self, abort: bool) -> Result<(), DbError>;
}

/// Builds a command completion tag from the statement's leading keywords.
pub fn command_tag(sql: &str, rows: u64) -> String {
    let mut words = sql.split_whitespace().map(|w| w.to_ascii_uppercase());
    let Some(verb) = words.next() else {
        return String::new();
    };
    match verb.as_str() {
        "INSERT" => format!("INSERT 0 {rows}"),
        "UPDATE" | "DELETE" => format!("{verb} {rows}"),
        "CREATE" | "DROP" | "ALTER" => match words.next() {
            Some(object) => format!("{verb} {}", object.trim_end_matches('(')),
            None => verb,
        },
        _ => verb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tag() {
        assert_eq!(command_tag("insert into t values (1)", 1), "INSERT 0 1");
        assert_eq!(command_tag("UPDATE t SET a = 1", 3), "UPDATE 3");
        assert_eq!(command_tag("create table t (a int)", 0), "CREATE TABLE");
        assert_eq!(command_tag("  vacuum", 0), "VACUUM");
        assert_eq!(command_tag("", 0), "");
    }
}

//! Database-level errors.

use super::transaction::TransactionState;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error reported by the bundled SQLite backend.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Error reported by another backend.
    #[error("database error: {0}")]
    Backend(String),
    /// A shared statement failed earlier; the transaction can only be rolled
    /// back now.
    #[error("current transaction is aborted, statements are refused until the session ends")]
    TransactionAborted,
    /// The backend ended the shared transaction underneath a worker's
    /// statement.
    #[error("the shared transaction was ended by the backend, statements are refused until the session ends")]
    TransactionEnded,
    /// The shared transaction is not accepting statements.
    #[error("shared transaction is not active (state: {0:?})")]
    NotActive(TransactionState),
    /// Clients may not end or nest the shared transaction themselves.
    #[error("'{0}' is reserved for the session exit protocol")]
    TransactionControl(String),
    /// The connection was already closed.
    #[error("database connection is closed")]
    Disconnected,
    /// The backend answered with something the caller cannot interpret.
    #[error("unexpected database result: {0}")]
    UnexpectedResult(&'static str),
}

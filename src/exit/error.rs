use crate::db::DbError;
use crate::sums::SumsError;

/// A step of the exit protocol that did not complete.
///
/// Steps log their failure and the protocol moves on; only a failed commit
/// changes the exit status.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Sums(#[from] SumsError),
    #[error("session log: {0}")]
    Log(#[from] std::io::Error),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

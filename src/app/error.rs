use std::io;
use std::path::PathBuf;

use crate::db::DbError;
use crate::sums::SumsError;

/// Errors that stop the server before it accepts its first client.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Sums(#[from] SumsError),
    #[error("failed to open storage root {path}: {source}")]
    SumsRoot { path: PathBuf, source: io::Error },
    #[error("failed to attach session log: {0}")]
    Log(io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to write announcement file {path}: {source}")]
    Announce { path: PathBuf, source: io::Error },
    #[error("startup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

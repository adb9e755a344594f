//! Error types for poolsched.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot build a job without intentions")]
    EmptyJob,

    /// The job no longer holds the intention: it was dissolved as stale and
    /// the work may have been claimed by another worker.
    #[error("claim lost: {0}")]
    ClaimLost(String),

    #[error("unknown intention kind: {0}")]
    UnknownKind(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

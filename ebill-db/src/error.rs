//! Error types for ebill-db

use thiserror::Error;

use crate::pool::EngineMode;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// Pool used before `initialize`, or after `dispose`
    #[error("{mode} database engine not initialized; call initialize first")]
    NotInitialized { mode: EngineMode },

    /// Could not establish or verify a connection
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Statement or commit failure inside the relational store
    #[error("Database storage error: {0}")]
    Storage(String),

    /// Session already committed, rolled back or released
    #[error("Session already closed")]
    SessionClosed,

    /// Migration set is malformed or disagrees with the recorded history
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Every migration attempt failed
    #[error("Migrations failed after {attempts} attempt(s): {reason}")]
    MigrationFailure { attempts: u32, reason: String },
}

impl DbError {
    /// True for failures that mean the backend is unreachable rather than misused.
    pub fn is_connection(&self) -> bool {
        matches!(self, DbError::Connection(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Configuration(_) => DbError::Connection(err.to_string()),
            other => DbError::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        use sqlx::migrate::MigrateError;
        match err {
            MigrateError::Execute(e) | MigrateError::ExecuteMigration(e, _) => DbError::from(e),
            other => DbError::InvalidMigration(other.to_string()),
        }
    }
}

use std::fmt;
use thiserror::Error;

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// The connection could not be acquired. Never retried.
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },
    /// Safe to retry without changing inputs (lock wait, dropped connection).
    #[error("Transient error: {0}")]
    Transient(String),
    /// Retrying cannot fix this (bad SQL, constraint violation).
    #[error("Fatal error: {0}")]
    Fatal(String),
    /// Terminal failure after every attempt hit a transient error.
    #[error("Operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DbError>,
    },
}

impl DbError {
    pub fn connection(target: impl fmt::Display, message: impl fmt::Display) -> Self {
        DbError::Connection {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }

    /// Short tag used in logs and audit lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Connection { .. } => "connection",
            DbError::Transient(_) => "transient",
            DbError::Fatal(_) => "fatal",
            DbError::RetriesExhausted { .. } => "exhausted",
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let primary = db_err
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => DbError::Transient(err.to_string()),
                    _ => DbError::Fatal(err.to_string()),
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Fatal(err.to_string()),
        }
    }
}

impl From<csv::Error> for DbError {
    fn from(err: csv::Error) -> Self {
        DbError::Fatal(format!("CSV error: {}", err))
    }
}

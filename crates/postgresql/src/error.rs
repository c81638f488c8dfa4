use std::error::Error as _;
use std::time::Duration;

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Errors returned by a replication connection.
///
/// Callers distinguish three classes: timeouts (no message yet), temporary
/// conditions worth retrying from the top, and everything else, which is fatal.
#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("No replication message within {0:?}")]
    Timeout(Duration),

    #[error("Database is in recovery mode")]
    InRecovery,

    #[error("Temporary replication failure: {0}")]
    Temporary(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(tokio_postgres::Error),

    #[error("Replication protocol error: {0}")]
    Protocol(String),

    #[error("Snapshot transaction failed: {0}")]
    Snapshot(anyhow::Error),

    #[error("Replication connection is closed")]
    Closed,
}

impl ReplicationError {
    /// Returns true when retrying the whole replication setup may succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            ReplicationError::Timeout(_)
                | ReplicationError::InRecovery
                | ReplicationError::Temporary(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReplicationError::Timeout(_))
    }
}

impl From<tokio_postgres::Error> for ReplicationError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return ReplicationError::Temporary(format!("connection closed: {err}"));
        }
        if let Some(code) = err.code() {
            if is_temporary_state(code) {
                return ReplicationError::Temporary(err.to_string());
            }
        }
        if err
            .source()
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .is_some()
        {
            return ReplicationError::Temporary(format!("I/O failure: {err}"));
        }
        ReplicationError::Postgres(err)
    }
}

/// Slot in use by another consumer, or the server not accepting connections yet.
fn is_temporary_state(code: &SqlState) -> bool {
    *code == SqlState::OBJECT_IN_USE
        || *code == SqlState::CANNOT_CONNECT_NOW
        || *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::TOO_MANY_CONNECTIONS
}

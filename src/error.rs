use etcd_sync_pgoutput::DecodeError;
use etcd_sync_postgresql::ReplicationError;
use etcd_sync_store::StoreError;
use thiserror::Error;

/// Errors raised by the sync pipeline.
///
/// Classification follows how the service reacts: cancellation is silent,
/// temporary failures restart the pipeline after a backoff, and everything
/// else stops the service.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Temporary failure: {0}")]
    Temporary(String),

    #[error("Replication error: {0}")]
    Replication(ReplicationError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("No resource mapping for table {0}")]
    UnknownTable(String),

    #[error("Cannot map row of table {table}: {reason}")]
    Mapping { table: String, reason: String },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("No fully qualified name known for {kind} {uuid}")]
    MissingFqn { kind: String, uuid: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Returns true when restarting the pipeline may succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            SyncError::Temporary(_) => true,
            SyncError::Replication(e) => e.is_temporary(),
            SyncError::Store(e) => e.is_temporary(),
            _ => false,
        }
    }
}

impl From<ReplicationError> for SyncError {
    fn from(err: ReplicationError) -> Self {
        match err {
            // Errors raised by the dump keep their own classification
            ReplicationError::Snapshot(inner) => match inner.downcast::<SyncError>() {
                Ok(sync_error) => sync_error,
                Err(other) => match other.downcast::<ReplicationError>() {
                    Ok(replication) => SyncError::from(replication),
                    Err(other) => SyncError::Other(other),
                },
            },
            other => SyncError::Replication(other),
        }
    }
}

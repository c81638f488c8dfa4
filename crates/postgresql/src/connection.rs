//! Replication connection contract

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_sync_pgoutput::{Lsn, Relation};

use crate::ReplicationError;

/// Replication slot acquired for one run of the watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Position from which the slot streams changes
    pub consistent_point: Lsn,
    /// Snapshot matching `consistent_point`, valid until the dump has run
    pub snapshot_name: String,
}

/// A single `pgoutput` message read from the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalMessage {
    /// WAL position of the record that produced this message
    pub lsn: Lsn,
    /// Raw `pgoutput` payload
    pub data: Bytes,
}

/// Connection to the source database used for logical replication.
///
/// One connection serves one watcher run: it is created by a
/// [`ConnectionFactory`], used through the slot, dump and streaming phases,
/// and closed on shutdown.
#[async_trait]
pub trait ReplicationConnection: Send {
    /// Reports whether the server is a hot standby in recovery.
    async fn is_in_recovery(&mut self) -> Result<bool, ReplicationError>;

    /// Drops and recreates the publication so it covers all current tables.
    async fn renew_publication(&mut self, name: &str) -> Result<(), ReplicationError>;

    /// Ensures the slot exists and returns its consistent point and snapshot.
    ///
    /// A stale slot from an earlier run is dropped first (best effort). A
    /// "slot already exists" failure on create is treated as success.
    async fn get_replication_slot(&mut self, name: &str) -> Result<SlotInfo, ReplicationError>;

    /// Starts streaming. `Lsn::ZERO` continues from the slot's own position.
    async fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> Result<(), ReplicationError>;

    /// Waits for the next WAL message.
    ///
    /// Returns [`ReplicationError::Timeout`] when nothing arrives in time.
    async fn wait_for_replication_message(
        &mut self,
        timeout: Duration,
    ) -> Result<WalMessage, ReplicationError>;

    /// Acknowledges progress so the server can reclaim WAL up to `saved`.
    async fn send_status(&mut self, received: Lsn, saved: Lsn) -> Result<(), ReplicationError>;

    /// Runs `body` in a read-only repeatable-read transaction pinned to the
    /// given snapshot.
    async fn do_in_transaction_snapshot(
        &mut self,
        snapshot_name: &str,
        body: &mut dyn SnapshotBody,
    ) -> Result<(), ReplicationError>;

    /// Closes the connection. Further calls fail with [`ReplicationError::Closed`].
    async fn close(&mut self) -> Result<(), ReplicationError>;
}

/// Work executed inside a snapshot-pinned transaction
#[async_trait]
pub trait SnapshotBody: Send {
    async fn run(&mut self, txn: &mut dyn SnapshotTransaction) -> anyhow::Result<()>;
}

/// Read access to the database state as of a snapshot
#[async_trait]
pub trait SnapshotTransaction: Send {
    /// Tables covered by `publication`, with their column metadata.
    async fn tables(&mut self, publication: &str) -> Result<Vec<Relation>, ReplicationError>;

    /// All rows of `relation`, values in text format, in column order.
    async fn rows(&mut self, relation: &Relation)
        -> Result<Vec<Vec<Option<String>>>, ReplicationError>;
}

/// Opens replication connections; called again on every retry.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    type Connection: ReplicationConnection;

    async fn connect(&self) -> Result<Self::Connection, ReplicationError>;
}

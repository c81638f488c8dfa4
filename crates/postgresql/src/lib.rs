//! PostgreSQL logical replication connection
//!
//! This library provides the replication side of etcd-sync: replication slot
//! and publication management, snapshot-pinned reads of the current table
//! contents, and a stream of `pgoutput` WAL messages.
//!
//! The [`ReplicationConnection`] trait is the seam used by the sync watcher.
//! [`PgReplicationConnection`] implements it over a regular `tokio-postgres`
//! connection using the logical decoding SQL functions.

mod config;
mod connection;
mod error;
mod replication;
mod snapshot;

pub use config::Config;
pub use connection::{
    ConnectionFactory, ReplicationConnection, SlotInfo, SnapshotBody, SnapshotTransaction,
    WalMessage,
};
pub use error::ReplicationError;
pub use replication::{PgConnectionFactory, PgReplicationConnection};

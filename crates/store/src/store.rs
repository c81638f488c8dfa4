//! Key-value store trait and types
//!
//! This module defines the KvStore trait consumed by the sync pipeline,
//! plus the watch and transaction types shared by all backends.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::StoreError;

/// A stored key with its value and revisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the last modification
    pub mod_revision: i64,
    /// Revision at which the key was created
    pub create_revision: i64,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Create,
    Modify,
    Delete,
    Unknown,
}

/// A single change delivered by [`KvStore::watch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Store revision of the change; all changes of one commit share it
    pub revision: i64,
    pub change_type: ChangeType,
    pub key: String,
    /// New value; empty for deletes
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Watch every key starting with the given key instead of the key itself
    pub prefix: bool,
}

impl WatchOptions {
    pub fn prefix() -> Self {
        Self { prefix: true }
    }
}

/// Commit precondition: `key` still has `mod_revision`, where 0 means
/// the key must not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub key: String,
    pub mod_revision: i64,
}

/// A buffered write applied by [`KvStore::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl Write {
    pub fn key(&self) -> &str {
        match self {
            Write::Put { key, .. } | Write::Delete { key } => key,
        }
    }
}

/// Trait for downstream store operations.
///
/// Implemented by:
/// - etcd (`EtcdStore`)
/// - in-memory storage (`MemoryStore`)
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Reads a key. Returns None if the key doesn't exist.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Writes a key only if it does not exist yet.
    ///
    /// Fails with [`StoreError::KeyExists`] otherwise.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Streams changes of `key` (or of every key under it with
    /// [`WatchOptions::prefix`]) until `cancel` fires.
    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        options: WatchOptions,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError>;

    /// Applies all `writes` atomically if every guard holds.
    ///
    /// Returns false, without writing anything, when a guard fails.
    async fn commit(&self, guards: &[Guard], writes: &[Write]) -> Result<bool, StoreError>;
}

//! Downstream key-value store for etcd-sync
//!
//! Provides the storage-agnostic store contract and an optimistic
//! software-transactional-memory helper on top of it.
//!
//! ## Backends
//!
//! - `EtcdStore` - etcd v3 through `etcd-client`
//! - `MemoryStore` - in-process store with the same revision and watch
//!   semantics, used by tests and dry runs
//!
//! ## Transactions
//!
//! [`do_in_transaction`] runs a [`TxnBody`] against an [`Stm`]: reads are
//! recorded with their mod revision, writes are buffered, and everything is
//! committed in one compare-and-swap. A conflicting concurrent write makes the
//! body run again with fresh reads.

mod error;
mod etcd;
mod memory;
mod stm;
pub mod store;

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use stm::{do_in_transaction, do_in_transaction_with_retries, Stm, TxnBody, DEFAULT_MAX_RETRIES};
pub use store::{ChangeType, Guard, KeyValue, KvStore, WatchEvent, WatchOptions, Write};

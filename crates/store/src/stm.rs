//! Optimistic software transactional memory over a [`KvStore`]

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::store::{Guard, KvStore, Write};
use crate::StoreError;

/// Attempts made by [`do_in_transaction`] before giving up on conflicts
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// In-progress transaction handed to a [`TxnBody`].
///
/// Reads go to the store (or to this transaction's own buffered writes) and
/// remember the revision they saw. Writes are buffered until commit.
pub struct Stm<'a> {
    store: &'a dyn KvStore,
    reads: HashMap<String, i64>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl<'a> Stm<'a> {
    fn new(store: &'a dyn KvStore) -> Self {
        Self {
            store,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }

        let kv = self.store.get(key).await?;
        let revision = kv.as_ref().map_or(0, |kv| kv.mod_revision);
        self.reads.entry(key.to_string()).or_insert(revision);
        Ok(kv.map(|kv| kv.value))
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    /// Number of buffered writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    async fn commit(self) -> Result<bool, StoreError> {
        if self.writes.is_empty() {
            return Ok(true);
        }

        let guards = self
            .reads
            .into_iter()
            .map(|(key, mod_revision)| Guard { key, mod_revision })
            .collect::<Vec<_>>();
        let writes = self
            .writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => Write::Put { key, value },
                None => Write::Delete { key },
            })
            .collect::<Vec<_>>();

        self.store.commit(&guards, &writes).await
    }
}

/// Work executed inside a store transaction.
///
/// The body may run more than once when it conflicts with concurrent writers,
/// so it must only touch the store through the given [`Stm`].
#[async_trait]
pub trait TxnBody: Send + Sync {
    type Error: From<StoreError> + Send;

    async fn run(&self, stm: &mut Stm<'_>) -> Result<(), Self::Error>;
}

/// Runs `body` and commits its writes atomically, retrying on conflict up to
/// [`DEFAULT_MAX_RETRIES`] times.
pub async fn do_in_transaction<B: TxnBody>(store: &dyn KvStore, body: &B) -> Result<(), B::Error> {
    do_in_transaction_with_retries(store, body, DEFAULT_MAX_RETRIES).await
}

pub async fn do_in_transaction_with_retries<B: TxnBody>(
    store: &dyn KvStore,
    body: &B,
    max_attempts: usize,
) -> Result<(), B::Error> {
    for attempt in 1..=max_attempts.max(1) {
        let mut stm = Stm::new(store);
        body.run(&mut stm).await?;
        let writes = stm.len();
        if stm.commit().await? {
            debug!("Committed transaction with {writes} writes (attempt {attempt})");
            return Ok(());
        }
        warn!("Transaction conflict on attempt {attempt}, retrying");
    }
    Err(StoreError::Conflict(max_attempts.max(1)).into())
}

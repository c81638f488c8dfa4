//! In-memory store implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::store::{ChangeType, Guard, KeyValue, KvStore, WatchEvent, WatchOptions, Write};
use crate::StoreError;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    create_revision: i64,
    mod_revision: i64,
}

struct Subscriber {
    key: String,
    prefix: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Subscriber {
    fn matches(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Default)]
struct Inner {
    revision: i64,
    data: BTreeMap<String, Entry>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    /// Applies writes under one new revision and notifies watchers.
    fn apply(&mut self, writes: &[Write]) {
        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(writes.len());

        for write in writes {
            match write {
                Write::Put { key, value } => {
                    let create_revision = self
                        .data
                        .get(key)
                        .map_or(revision, |entry| entry.create_revision);
                    let change_type = if create_revision == revision {
                        ChangeType::Create
                    } else {
                        ChangeType::Modify
                    };
                    self.data.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            create_revision,
                            mod_revision: revision,
                        },
                    );
                    events.push(WatchEvent {
                        revision,
                        change_type,
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
                Write::Delete { key } => {
                    if self.data.remove(key).is_some() {
                        events.push(WatchEvent {
                            revision,
                            change_type: ChangeType::Delete,
                            key: key.clone(),
                            value: Vec::new(),
                        });
                    }
                }
            }
        }

        self.subscribers.retain(|s| !s.tx.is_closed());
        for event in events {
            for subscriber in self.subscribers.iter().filter(|s| s.matches(&event.key)) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }
}

/// Store kept in process memory.
///
/// Follows etcd semantics: a single revision counter incremented once per
/// write or commit, and watch events carrying the revision of their commit.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current store revision
    pub async fn revision(&self) -> i64 {
        self.inner.lock().await.revision
    }

    /// Keys and values under `prefix`, in key order.
    pub async fn list(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.lock().await;
        inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.data.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
            create_revision: entry.create_revision,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.apply(&[Write::Put {
            key: key.to_string(),
            value,
        }]);
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.data.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        inner.apply(&[Write::Put {
            key: key.to_string(),
            value,
        }]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.data.contains_key(key) {
            inner.apply(&[Write::Delete {
                key: key.to_string(),
            }]);
        }
        Ok(())
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        options: WatchOptions,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.lock().await.subscribers.push(Subscriber {
            key: key.to_string(),
            prefix: options.prefix,
            tx: inner_tx,
        });

        // Forward until cancelled so the receiver sees the end of the stream
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = inner_rx.recv() => match event {
                        Some(event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn commit(&self, guards: &[Guard], writes: &[Write]) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let holds = guards.iter().all(|guard| {
            let current = inner.data.get(&guard.key).map_or(0, |e| e.mod_revision);
            current == guard.mod_revision
        });
        if !holds {
            return Ok(false);
        }
        if !writes.is_empty() {
            inner.apply(writes);
        }
        Ok(true)
    }
}

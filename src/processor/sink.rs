use std::sync::Arc;

use async_trait::async_trait;
use etcd_sync_store::{do_in_transaction, KvStore, Stm, TxnBody};
use serde_json::{Map, Value};
use tracing::debug;

use crate::event::{EventList, Operation};
use crate::processor::EventSink;
use crate::SyncError;

/// Writes events to the key-value store, one store transaction per unit.
///
/// Values are the JSON-encoded payload under `/<root>/<kind>/<primary key>`.
/// Every write is replay safe: creates overwrite, updates merge the payload
/// into the stored object (creating it when absent), deletes of missing keys
/// are no-ops.
pub struct StoreSink {
    store: Arc<dyn KvStore>,
    root: String,
}

impl StoreSink {
    pub fn new(store: Arc<dyn KvStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    async fn apply(&self, events: EventList) -> Result<(), SyncError> {
        let count = events.len();
        let body = ApplyEvents {
            root: &self.root,
            events,
        };
        do_in_transaction(self.store.as_ref(), &body).await?;
        debug!("Applied {count} events to the store");
        Ok(())
    }
}

struct ApplyEvents<'a> {
    root: &'a str,
    events: EventList,
}

#[async_trait]
impl TxnBody for ApplyEvents<'_> {
    type Error = SyncError;

    async fn run(&self, stm: &mut Stm<'_>) -> Result<(), SyncError> {
        for event in &self.events {
            let key = event.key(self.root);
            match event.operation {
                Operation::Create => {
                    stm.put(key, encode(&event.payload)?);
                }
                Operation::Update => {
                    let mut merged = match stm.get(&key).await? {
                        Some(existing) => decode(&key, &existing)?,
                        None => Map::new(),
                    };
                    for (field, value) in &event.payload {
                        merged.insert(field.clone(), value.clone());
                    }
                    stm.put(key, encode(&merged)?);
                }
                Operation::Delete => {
                    stm.delete(key);
                }
            }
        }
        Ok(())
    }
}

fn encode(payload: &Map<String, Value>) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(payload).map_err(|e| SyncError::Other(e.into()))
}

fn decode(key: &str, raw: &[u8]) -> Result<Map<String, Value>, SyncError> {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) | Err(_) => Err(SyncError::Other(anyhow::anyhow!(
            "stored value at {key} is not a JSON object"
        ))),
    }
}

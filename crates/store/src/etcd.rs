//! etcd v3 store implementation.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, Txn, TxnOp, WatchOptions as EtcdWatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{ChangeType, Guard, KeyValue, KvStore, WatchEvent, WatchOptions, Write};
use crate::StoreError;

/// Store backed by an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to the given etcd endpoints.
    pub async fn connect<E: AsRef<str>>(endpoints: &[E]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None).await?;
        info!("Connected to etcd");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_key_value(kv: &etcd_client::KeyValue) -> Result<KeyValue, StoreError> {
    Ok(KeyValue {
        key: kv.key_str()?.to_string(),
        value: kv.value().to_vec(),
        mod_revision: kv.mod_revision(),
        create_revision: kv.create_revision(),
    })
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let response = self.client.kv_client().get(key, None).await?;
        response.kvs().first().map(to_key_value).transpose()
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.client.kv_client().put(key, value, None).await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let response = self.client.kv_client().txn(txn).await?;
        if !response.succeeded() {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client.kv_client().delete(key, None).await?;
        Ok(())
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        key: &str,
        options: WatchOptions,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        let etcd_options = if options.prefix {
            EtcdWatchOptions::new().with_prefix()
        } else {
            EtcdWatchOptions::new()
        };
        let (mut watcher, mut stream) = self
            .client
            .watch_client()
            .watch(key, Some(etcd_options))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = key.to_string();

        tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = cancel.cancelled() => break,
                    response = stream.message() => response,
                };
                let response = match response {
                    Ok(Some(response)) => response,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Watch on {watched} failed: {e}");
                        break;
                    }
                };

                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    let change_type = match event.event_type() {
                        EventType::Put if kv.create_revision() == kv.mod_revision() => {
                            ChangeType::Create
                        }
                        EventType::Put => ChangeType::Modify,
                        EventType::Delete => ChangeType::Delete,
                    };
                    let Ok(key) = kv.key_str() else {
                        warn!("Skipping watch event with non UTF-8 key");
                        continue;
                    };
                    let watch_event = WatchEvent {
                        revision: kv.mod_revision(),
                        change_type,
                        key: key.to_string(),
                        value: kv.value().to_vec(),
                    };
                    if tx.send(watch_event).is_err() {
                        return;
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                debug!("Cancelling watch on {watched}: {e}");
            }
        });

        Ok(rx)
    }

    async fn commit(&self, guards: &[Guard], writes: &[Write]) -> Result<bool, StoreError> {
        let compares = guards
            .iter()
            .map(|g| Compare::mod_revision(g.key.as_str(), CompareOp::Equal, g.mod_revision))
            .collect::<Vec<_>>();
        let ops = writes
            .iter()
            .map(|write| match write {
                Write::Put { key, value } => TxnOp::put(key.as_str(), value.clone(), None),
                Write::Delete { key } => TxnOp::delete(key.as_str(), None),
            })
            .collect::<Vec<_>>();

        let response = self
            .client
            .kv_client()
            .txn(Txn::new().when(compares).and_then(ops))
            .await?;
        Ok(response.succeeded())
    }
}

//! Lifecycle wrapper around the watcher

use std::sync::Arc;

use etcd_sync_postgresql::ConnectionFactory;
use etcd_sync_store::KvStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::handler::MessageHandler;
use crate::lsn::LsnTracker;
use crate::mapping::{EventDecoder, ResourceRegistry};
use crate::processor::{FqnCache, Pipeline, StoreSink};
use crate::watcher::{DumpSignal, Watcher};
use crate::SyncError;

/// Runs the replication pipeline until closed or failed.
///
/// Every attempt opens a fresh connection and rebuilds the pipeline, so a
/// restart re-acquires the slot and resumes from the last acknowledged
/// position. Temporary failures are retried with bounded exponential backoff;
/// the attempt counter starts over once an attempt got past its dump.
pub struct Service<F: ConnectionFactory> {
    factory: F,
    store: Arc<dyn KvStore>,
    registry: Arc<ResourceRegistry>,
    config: SyncConfig,
    cancel: CancellationToken,
    dump_signal: Arc<DumpSignal>,
}

impl<F: ConnectionFactory> Service<F> {
    pub fn new(
        factory: F,
        store: Arc<dyn KvStore>,
        registry: ResourceRegistry,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        registry.validate()?;
        Ok(Self {
            factory,
            store,
            registry: Arc::new(registry),
            config,
            cancel: CancellationToken::new(),
            dump_signal: Arc::new(DumpSignal::new()),
        })
    }

    /// Blocks until [`Service::close`] is called or a fatal error occurs.
    pub async fn run(&self) -> Result<(), SyncError> {
        let policy = &self.config.retry;
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let (result, dump_completed) = self.run_once().await;
            let err = match result {
                Ok(()) => {
                    info!("Sync service stopped");
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) if e.is_temporary() => e,
                Err(e) => {
                    error!("Sync service failed: {e}");
                    return Err(e);
                }
            };

            if dump_completed {
                failures = 0;
            }
            failures += 1;
            if failures >= policy.max_attempts {
                error!("Giving up after {failures} consecutive failures: {err}");
                return Err(err);
            }

            let delay = policy.backoff(failures);
            warn!(
                "Temporary failure (attempt {failures}/{}), retrying in {delay:?}: {err}",
                policy.max_attempts
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self) -> (Result<(), SyncError>, bool) {
        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return (Err(SyncError::Cancelled), false),
            conn = self.factory.connect() => match conn {
                Ok(conn) => conn,
                Err(e) => return (Err(e.into()), false),
            },
        };

        let tracker = Arc::new(LsnTracker::new());
        let sink = Arc::new(StoreSink::new(
            self.store.clone(),
            self.config.root_path.clone(),
        ));
        let pipeline = Pipeline::new(sink).with_stage(FqnCache::new());
        let handler = MessageHandler::new(
            EventDecoder::new(self.registry.clone()),
            pipeline,
            tracker.clone(),
        );

        let mut watcher = Watcher::new(
            conn,
            self.config.clone(),
            handler,
            tracker,
            self.dump_signal.clone(),
        );
        let result = watcher.watch(self.cancel.clone()).await;
        (result, watcher.dump_completed())
    }

    /// Stops the running pipeline. `run` returns `Ok(())` afterwards.
    pub fn close(&self) {
        info!("Closing sync service");
        self.cancel.cancel();
    }

    /// Receiver that turns `true` once the initial state has been replicated.
    pub fn dump_done(&self) -> watch::Receiver<bool> {
        self.dump_signal.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

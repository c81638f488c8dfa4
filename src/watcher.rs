//! Replication watcher state machine
//!
//! A watcher run goes through
//! `Init -> CheckingRecovery -> AcquiringSlot -> Dumping -> Streaming -> Closed`
//! and ends in `Error` when anything fails.
//!
//! While streaming, a producer loop reads WAL messages and sends status
//! updates on a timer, and a consumer loop feeds the messages through the
//! handler. They are connected by a single-slot channel, so a slow consumer
//! throttles intake.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use etcd_sync_pgoutput::Lsn;
use etcd_sync_postgresql::{ReplicationConnection, ReplicationError, SlotInfo, WalMessage};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::dump::Dumper;
use crate::handler::MessageHandler;
use crate::lsn::LsnTracker;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Init,
    CheckingRecovery,
    AcquiringSlot,
    Dumping,
    Streaming,
    Closed,
    Error,
}

impl WatcherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherState::Init => "init",
            WatcherState::CheckingRecovery => "checking_recovery",
            WatcherState::AcquiringSlot => "acquiring_slot",
            WatcherState::Dumping => "dumping",
            WatcherState::Streaming => "streaming",
            WatcherState::Closed => "closed",
            WatcherState::Error => "error",
        }
    }
}

/// One-shot "initial state replicated" notification.
///
/// Signalling is idempotent: only the first call flips the flag and wakes
/// subscribers, later dumps leave it alone.
#[derive(Debug)]
pub struct DumpSignal {
    done: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Default for DumpSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            done: AtomicBool::new(false),
            tx,
        }
    }

    /// Marks the dump done. Returns true on the first call only.
    pub fn signal(&self) -> bool {
        if self.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Receiver that observes `true` once the dump is done.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Drives one replication run over a connection
pub struct Watcher<C: ReplicationConnection> {
    conn: C,
    config: SyncConfig,
    handler: MessageHandler,
    tracker: Arc<LsnTracker>,
    dump_signal: Arc<DumpSignal>,
    state: WatcherState,
    dump_completed: bool,
}

enum Step {
    Cancelled,
    Status,
    Message(Result<WalMessage, ReplicationError>),
}

impl<C: ReplicationConnection> Watcher<C> {
    pub fn new(
        conn: C,
        config: SyncConfig,
        handler: MessageHandler,
        tracker: Arc<LsnTracker>,
        dump_signal: Arc<DumpSignal>,
    ) -> Self {
        Self {
            conn,
            config,
            handler,
            tracker,
            dump_signal,
            state: WatcherState::Init,
            dump_completed: false,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// True once this run finished its dump (or skipped it) and moved on to
    /// streaming.
    pub fn dump_completed(&self) -> bool {
        self.dump_completed
    }

    fn transition(&mut self, next: WatcherState) {
        info!(
            "Watcher state {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
    }

    /// Runs until cancelled or failed.
    ///
    /// Cancellation is not an error: it closes the connection and returns
    /// `Ok(())`.
    pub async fn watch(&mut self, cancel: CancellationToken) -> Result<(), SyncError> {
        let result = self.run(&cancel).await;
        let result = match result {
            Err(e) if e.is_cancelled() => {
                info!("Watcher cancelled");
                Ok(())
            }
            other => other,
        };

        if let Err(e) = self.conn.close().await {
            debug!("Closing replication connection: {e}");
        }
        match &result {
            Ok(()) => self.transition(WatcherState::Closed),
            Err(e) => {
                error!("Watcher failed: {e}");
                self.transition(WatcherState::Error);
            }
        }
        result
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        self.transition(WatcherState::CheckingRecovery);
        if until_cancelled(cancel, self.conn.is_in_recovery()).await? {
            return Err(ReplicationError::InRecovery.into());
        }

        self.transition(WatcherState::AcquiringSlot);
        let publication = self.config.publication_name.clone();
        let slot_name = self.config.slot_name.clone();
        until_cancelled(cancel, self.conn.renew_publication(&publication)).await?;
        let slot = until_cancelled(cancel, self.conn.get_replication_slot(&slot_name)).await?;
        self.tracker.update_received(slot.consistent_point);

        if self.config.dump {
            self.transition(WatcherState::Dumping);
            self.dump(cancel, &slot).await?;
        }
        self.dump_completed = true;
        if self.dump_signal.signal() {
            info!("Initial state replicated");
        }

        self.transition(WatcherState::Streaming);
        until_cancelled(
            cancel,
            self.conn
                .start_replication(&slot_name, &publication, Lsn::ZERO),
        )
        .await?;
        self.stream(cancel).await
    }

    async fn dump(&mut self, cancel: &CancellationToken, slot: &SlotInfo) -> Result<(), SyncError> {
        self.tracker.transaction_started();
        let mut dumper = Dumper::new(
            &mut self.handler,
            &self.config.publication_name,
            self.config.dump_batch_size,
        );
        until_cancelled(
            cancel,
            self.conn
                .do_in_transaction_snapshot(&slot.snapshot_name, &mut dumper),
        )
        .await?;
        self.tracker.transaction_finished(slot.consistent_point);
        Ok(())
    }

    async fn stream(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let (tx, rx) = mpsc::channel(1);
        let interval = self.config.status_interval;

        let producer = produce(&mut self.conn, &self.tracker, tx, cancel, interval);
        let consumer = consume(&mut self.handler, &self.tracker, rx);
        tokio::try_join!(producer, consumer)?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// Resolves `fut` unless `cancel` fires first.
async fn until_cancelled<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, E>>,
    SyncError: From<E>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = fut => result.map_err(SyncError::from),
    }
}

async fn produce<C: ReplicationConnection>(
    conn: &mut C,
    tracker: &LsnTracker,
    tx: mpsc::Sender<WalMessage>,
    cancel: &CancellationToken,
    interval: Duration,
) -> Result<(), SyncError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            _ = ticker.tick() => Step::Status,
            message = conn.wait_for_replication_message(interval) => Step::Message(message),
        };

        match step {
            Step::Cancelled => break,
            Step::Status => {
                let (received, saved) = tracker.values();
                debug!("Sending status: received {received}, saved {saved}");
                conn.send_status(received, saved).await?;
            }
            Step::Message(Err(e)) if e.is_timeout() => continue,
            Step::Message(Err(e)) => return Err(e.into()),
            Step::Message(Ok(message)) => {
                tracker.update_received(message.lsn);
                tracker.transaction_started();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            // Consumer is gone; its error surfaces from the join
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    info!("Stopping replication stream");
    conn.close().await?;
    Ok(())
}

async fn consume(
    handler: &mut MessageHandler,
    tracker: &LsnTracker,
    mut rx: mpsc::Receiver<WalMessage>,
) -> Result<(), SyncError> {
    while let Some(message) = rx.recv().await {
        let applied = handler.handle(&message).await?;
        tracker.transaction_finished(applied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dump_signal_fires_once() {
        let signal = DumpSignal::new();
        let mut rx = signal.subscribe();
        assert!(!signal.is_done());

        assert!(signal.signal());
        assert!(!signal.signal());
        assert!(signal.is_done());

        rx.wait_for(|done| *done).await.unwrap();
        assert!(*signal.subscribe().borrow());
    }

    #[test]
    fn test_dump_signal_wakes_waiting_subscriber() {
        let signal = DumpSignal::new();
        let mut rx = signal.subscribe();
        let mut changed = tokio_test::task::spawn(rx.changed());
        tokio_test::assert_pending!(changed.poll());

        signal.signal();
        assert!(changed.is_woken());
        tokio_test::assert_ready_ok!(changed.poll());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(WatcherState::CheckingRecovery.as_str(), "checking_recovery");
        assert_eq!(WatcherState::Error.as_str(), "error");
    }
}

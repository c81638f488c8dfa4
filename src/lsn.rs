//! Tracking of received and durably applied WAL positions

use std::sync::{Mutex, MutexGuard, PoisonError};

use etcd_sync_pgoutput::Lsn;
use tracing::warn;

#[derive(Debug, Default)]
struct State {
    received: Lsn,
    saved: Lsn,
    in_progress: u64,
}

/// Received and saved positions shared by the streaming loops and the
/// status sender.
///
/// `saved` never exceeds `received` and only moves forward.
#[derive(Debug, Default)]
pub struct LsnTracker {
    state: Mutex<State>,
}

impl LsnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raises the received position to `lsn` if it is greater.
    pub fn update_received(&self, lsn: Lsn) {
        let mut state = self.lock();
        if lsn > state.received {
            state.received = lsn;
        }
    }

    /// Returns `(received, saved)`.
    ///
    /// With nothing in flight everything received has been applied, so
    /// `saved` catches up with `received` first.
    pub fn values(&self) -> (Lsn, Lsn) {
        let mut state = self.lock();
        if state.in_progress == 0 {
            state.saved = state.received;
        }
        (state.received, state.saved)
    }

    pub fn transaction_started(&self) {
        self.lock().in_progress += 1;
    }

    /// Marks one unit as applied up to `processed`; `Lsn::ZERO` leaves
    /// `saved` where it is.
    pub fn transaction_finished(&self, processed: Lsn) {
        let mut state = self.lock();
        if state.in_progress == 0 {
            warn!("LSN tracker finished a transaction that was never started");
        } else {
            state.in_progress -= 1;
        }
        if processed > state.saved {
            state.saved = processed;
        }
        if state.saved > state.received {
            state.received = state.saved;
        }
    }

    pub fn in_progress(&self) -> u64 {
        self.lock().in_progress
    }
}

//! Grouping of events by source transaction

use etcd_sync_pgoutput::Lsn;

use crate::event::{Event, EventList};
use crate::SyncError;

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    InTransaction { final_lsn: Lsn, events: EventList },
}

/// Buffers events between Begin and Commit.
///
/// At most one transaction is open at a time. Events seen while idle are
/// returned immediately as their own unit.
#[derive(Debug, Default)]
pub struct TransactionAggregator {
    state: State,
}

impl TransactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.state, State::InTransaction { .. })
    }

    /// Opens a transaction. A Begin inside an open transaction is fatal.
    pub fn begin(&mut self, final_lsn: Lsn) -> Result<(), SyncError> {
        if let State::InTransaction {
            final_lsn: open, ..
        } = &self.state
        {
            return Err(SyncError::Protocol(format!(
                "begin of transaction {final_lsn} while transaction {open} is open"
            )));
        }
        self.state = State::InTransaction {
            final_lsn,
            events: EventList::new(),
        };
        Ok(())
    }

    /// Adds the events of one data message.
    ///
    /// Returns them as a unit to process right away when no transaction is
    /// open, otherwise buffers them and returns None.
    pub fn add(&mut self, new_events: Vec<Event>) -> Option<EventList> {
        match &mut self.state {
            State::Idle => Some(EventList::from(new_events)),
            State::InTransaction { events, .. } => {
                events.extend(new_events);
                None
            }
        }
    }

    /// Closes the open transaction and returns its events.
    pub fn commit(&mut self) -> Result<EventList, SyncError> {
        match std::mem::take(&mut self.state) {
            State::InTransaction { events, .. } => Ok(events),
            State::Idle => Err(SyncError::Protocol(
                "commit without an open transaction".to_string(),
            )),
        }
    }
}

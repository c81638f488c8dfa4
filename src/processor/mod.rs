//! Event processor chain
//!
//! Events flow through an ordered list of [`EventProcessor`] stages and end in
//! an [`EventSink`]. Each stage receives the whole unit and returns the unit
//! to forward; an error rejects the unit before anything reaches the sink.

mod fqn;
mod sink;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::event::EventList;
use crate::SyncError;

pub use fqn::FqnCache;
pub use sink::StoreSink;

/// A synchronous enrichment stage
pub trait EventProcessor: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, events: EventList) -> Result<EventList, SyncError>;
}

/// Final destination of processed events.
///
/// `apply` must write the whole list atomically and be safe to call again
/// with a list it has already applied.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn apply(&self, events: EventList) -> Result<(), SyncError>;
}

/// Stages composed in order, terminated by a sink
pub struct Pipeline {
    stages: Vec<Box<dyn EventProcessor>>,
    sink: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            stages: Vec::new(),
            sink,
        }
    }

    pub fn with_stage(mut self, stage: impl EventProcessor + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub async fn process(&mut self, events: EventList) -> Result<(), SyncError> {
        let mut events = events;
        for stage in &mut self.stages {
            events = stage.process(events)?;
            debug!("Stage {} forwarded {} events", stage.name(), events.len());
        }
        if events.is_empty() {
            return Ok(());
        }
        self.sink.apply(events).await
    }
}

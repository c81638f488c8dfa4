//! Dispatch of decoded WAL messages through the pipeline

use std::sync::Arc;

use etcd_sync_pgoutput::{
    decode, DecodedRow, LogicalMessage, Lsn, Relation, RelationSet, Tuple, TupleData,
};
use etcd_sync_postgresql::WalMessage;
use tracing::{debug, info};

use crate::event::{Event, EventList, Operation};
use crate::lsn::LsnTracker;
use crate::mapping::EventDecoder;
use crate::processor::Pipeline;
use crate::transaction::TransactionAggregator;
use crate::SyncError;

/// Consumer side of the stream.
///
/// Owns the relation cache, the event decoder, the transaction aggregator and
/// the processor chain. Only the consumer task touches it.
pub struct MessageHandler {
    relations: RelationSet,
    decoder: EventDecoder,
    aggregator: TransactionAggregator,
    pipeline: Pipeline,
    tracker: Arc<LsnTracker>,
}

impl MessageHandler {
    pub fn new(decoder: EventDecoder, pipeline: Pipeline, tracker: Arc<LsnTracker>) -> Self {
        Self {
            relations: RelationSet::default(),
            decoder,
            aggregator: TransactionAggregator::new(),
            pipeline,
            tracker,
        }
    }

    pub fn decoder(&self) -> &EventDecoder {
        &self.decoder
    }

    pub fn in_transaction(&self) -> bool {
        self.aggregator.in_transaction()
    }

    /// Handles one WAL message.
    ///
    /// Returns the position that is durably applied once this call returns:
    /// the end of the transaction for a commit, the message position for a
    /// standalone change, and `Lsn::ZERO` when nothing was applied.
    pub async fn handle(&mut self, message: &WalMessage) -> Result<Lsn, SyncError> {
        let decoded = decode(&message.data)?;
        debug!("Handling {} at {}", decoded.kind(), message.lsn);

        match decoded {
            LogicalMessage::Begin(begin) => {
                self.aggregator.begin(begin.final_lsn)?;
                // Held until the commit is applied
                self.tracker.transaction_started();
                Ok(Lsn::ZERO)
            }
            LogicalMessage::Commit(commit) => {
                let events = self.aggregator.commit()?;
                let count = events.len();
                self.pipeline.process(events).await?;
                self.tracker.transaction_finished(commit.end_lsn);
                debug!("Committed {count} events up to {}", commit.end_lsn);
                Ok(commit.end_lsn)
            }
            LogicalMessage::Relation(relation) => {
                self.relations.insert(relation);
                Ok(Lsn::ZERO)
            }
            LogicalMessage::Origin(origin) => {
                debug!("Ignoring origin {}", origin.name);
                Ok(Lsn::ZERO)
            }
            LogicalMessage::Type(type_info) => {
                debug!("Ignoring type {}.{}", type_info.namespace, type_info.name);
                Ok(Lsn::ZERO)
            }
            LogicalMessage::Insert(insert) => {
                let row = self.relations.decode_row(insert.relation_id, &insert.tuple)?;
                let event = self.decoder.decode(Operation::Create, &row)?;
                self.dispatch(vec![event], message.lsn).await
            }
            LogicalMessage::Update(update) => {
                let new_row = self
                    .relations
                    .decode_row(update.relation_id, &update.new_tuple)?;
                let mut events = Vec::with_capacity(2);
                if let Some(old_tuple) = &update.old_tuple {
                    let old_row = self.relations.decode_row(update.relation_id, old_tuple)?;
                    // A changed primary key moves the resource to a new key
                    if old_row.primary_key != new_row.primary_key {
                        events.push(self.decoder.decode(Operation::Delete, &old_row)?);
                    }
                }
                events.push(self.decoder.decode(Operation::Update, &new_row)?);
                self.dispatch(events, message.lsn).await
            }
            LogicalMessage::Delete(delete) => {
                let row = self
                    .relations
                    .decode_row(delete.relation_id, &delete.old_tuple)?;
                let event = self.decoder.decode(Operation::Delete, &row)?;
                self.dispatch(vec![event], message.lsn).await
            }
            LogicalMessage::Truncate(truncate) => {
                let names = truncate
                    .relation_ids
                    .iter()
                    .map(|id| {
                        self.relations
                            .get(*id)
                            .map(Relation::qualified_name)
                            .unwrap_or_else(|_| id.to_string())
                    })
                    .collect::<Vec<_>>();
                Err(SyncError::Protocol(format!(
                    "truncate of {} cannot be replicated",
                    names.join(", ")
                )))
            }
        }
    }

    async fn dispatch(&mut self, events: Vec<Event>, lsn: Lsn) -> Result<Lsn, SyncError> {
        match self.aggregator.add(events) {
            Some(standalone) => {
                self.pipeline.process(standalone).await?;
                Ok(lsn)
            }
            None => Ok(Lsn::ZERO),
        }
    }

    /// Replays snapshot rows of one table as create events in one unit.
    pub async fn apply_snapshot_rows(
        &mut self,
        relation: &Relation,
        rows: &[Vec<Option<String>>],
    ) -> Result<usize, SyncError> {
        let mut events = EventList::new();
        for values in rows {
            let tuple = Tuple(values.iter().cloned().map(TupleData::from).collect());
            let row: DecodedRow = relation.decode_row(&tuple)?;
            events.push(self.decoder.decode(Operation::Create, &row)?);
        }
        let count = events.len();
        self.pipeline.process(events).await?;
        if count > 0 {
            info!("Replayed {count} rows of {}", relation.qualified_name());
        }
        Ok(count)
    }
}

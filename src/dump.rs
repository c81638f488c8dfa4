//! Replay of the current table contents under the slot's snapshot

use async_trait::async_trait;
use etcd_sync_postgresql::{SnapshotBody, SnapshotTransaction};
use tracing::{info, warn};

use crate::handler::MessageHandler;

/// Snapshot body that replays every mapped table as create events through
/// the live pipeline.
///
/// Resource tables go first so reference targets are known by the time
/// reference rows arrive. Rows are written in chunks of `batch_size`, one
/// store transaction per chunk.
pub struct Dumper<'a> {
    handler: &'a mut MessageHandler,
    publication: &'a str,
    batch_size: usize,
    rows_replayed: usize,
}

impl<'a> Dumper<'a> {
    pub fn new(handler: &'a mut MessageHandler, publication: &'a str, batch_size: usize) -> Self {
        Self {
            handler,
            publication,
            batch_size: batch_size.max(1),
            rows_replayed: 0,
        }
    }

    pub fn rows_replayed(&self) -> usize {
        self.rows_replayed
    }
}

#[async_trait]
impl SnapshotBody for Dumper<'_> {
    async fn run(&mut self, txn: &mut dyn SnapshotTransaction) -> anyhow::Result<()> {
        let mut tables = Vec::new();
        for relation in txn.tables(self.publication).await? {
            if self
                .handler
                .decoder()
                .knows(&relation.namespace, &relation.name)
            {
                tables.push(relation);
            } else {
                warn!(
                    "Skipping unmapped table {} in dump",
                    relation.qualified_name()
                );
            }
        }

        let registry = self.handler.decoder().registry();
        tables.sort_by_key(|relation| registry.is_reference(&relation.namespace, &relation.name));

        for relation in &tables {
            let rows = txn.rows(relation).await?;
            for chunk in rows.chunks(self.batch_size) {
                self.rows_replayed += self.handler.apply_snapshot_rows(relation, chunk).await?;
            }
        }

        info!(
            "Dump replayed {} rows from {} tables",
            self.rows_replayed,
            tables.len()
        );
        Ok(())
    }
}

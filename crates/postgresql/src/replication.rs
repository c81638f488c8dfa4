//! Logical replication over the SQL decoding functions
//!
//! Changes are read with `pg_logical_slot_peek_binary_changes` and the slot is
//! advanced with `pg_replication_slot_advance` once the consumer has durably
//! applied them, so nothing is lost if the process stops between the two.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_sync_pgoutput::{decode, DecodeError, LogicalMessage, Lsn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, IsolationLevel, NoTls};
use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionFactory, ReplicationConnection, SlotInfo, SnapshotBody, WalMessage,
};
use crate::snapshot::PgSnapshot;
use crate::{Config, ReplicationError};

/// Opens [`PgReplicationConnection`]s from a shared [`Config`]
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    config: Config,
}

impl PgConnectionFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = PgReplicationConnection;

    async fn connect(&self) -> Result<PgReplicationConnection, ReplicationError> {
        PgReplicationConnection::connect(self.config.clone()).await
    }
}

/// Connection with its driver task
struct Session {
    client: Client,
    driver: JoinHandle<()>,
}

impl Session {
    async fn open(config: &Config, role: &'static str) -> Result<Self, ReplicationError> {
        let (client, connection) = config.postgres_config.connect(NoTls).await?;

        // Spawn connection handler
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL {role} connection error: {e}");
            }
        });
        Ok(Self { client, driver })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Streaming position of a started replication
struct Stream {
    slot: String,
    publication: String,
    /// Messages fetched but not yet handed out
    pending: VecDeque<WalMessage>,
    /// Commit end LSN of the last transaction handed out
    delivered: Lsn,
    /// Position the slot was last advanced to
    acknowledged: Lsn,
}

/// [`ReplicationConnection`] over a regular `tokio-postgres` connection
pub struct PgReplicationConnection {
    config: Config,
    session: Option<Session>,
    /// Keeps the exported snapshot alive until the dump has used it
    snapshot_holder: Option<Session>,
    slot_position: Lsn,
    stream: Option<Stream>,
}

impl PgReplicationConnection {
    pub async fn connect(config: Config) -> Result<Self, ReplicationError> {
        let session = Session::open(&config, "replication").await?;
        Ok(Self {
            config,
            session: Some(session),
            snapshot_holder: None,
            slot_position: Lsn::ZERO,
            stream: None,
        })
    }

    fn client(&mut self) -> Result<&mut Client, ReplicationError> {
        self.session
            .as_mut()
            .map(|session| &mut session.client)
            .ok_or(ReplicationError::Closed)
    }

    async fn create_slot(&mut self, name: &str) -> Result<Lsn, ReplicationError> {
        let client = self.client()?;
        let created = client
            .query_one(
                "SELECT lsn FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&name],
            )
            .await;

        let lsn: Option<PgLsn> = match created {
            Ok(row) => row.get(0),
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                info!("Replication slot {name} already exists, reusing it");
                client
                    .query_one(
                        "SELECT COALESCE(confirmed_flush_lsn, restart_lsn) \
                         FROM pg_replication_slots WHERE slot_name = $1",
                        &[&name],
                    )
                    .await?
                    .get(0)
            }
            Err(e) => return Err(e.into()),
        };

        lsn.map(to_lsn).ok_or_else(|| {
            ReplicationError::Protocol(format!("replication slot {name} has no position"))
        })
    }

    /// Exports a snapshot from a second connection and keeps its
    /// transaction open.
    async fn export_snapshot(&mut self) -> Result<String, ReplicationError> {
        let holder = Session::open(&self.config, "snapshot").await?;
        holder
            .client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        let snapshot_name: String = holder
            .client
            .query_one("SELECT pg_export_snapshot()", &[])
            .await?
            .get(0);
        self.snapshot_holder = Some(holder);
        Ok(snapshot_name)
    }

    /// Reads changes past the last delivered transaction into `pending`.
    async fn poll(&mut self) -> Result<(), ReplicationError> {
        let batch_size = self.config.batch_size;
        let session = self.session.as_ref().ok_or(ReplicationError::Closed)?;
        let stream = self.stream.as_mut().ok_or_else(|| {
            ReplicationError::Protocol("replication has not been started".to_string())
        })?;

        let rows = session
            .client
            .query(
                "SELECT lsn, data FROM pg_logical_slot_peek_binary_changes(\
                 $1, NULL, $2, 'proto_version', '1', 'publication_names', $3)",
                &[&stream.slot, &batch_size, &stream.publication],
            )
            .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: PgLsn = row.get(0);
            let data: Vec<u8> = row.get(1);
            changes.push(WalMessage {
                lsn: to_lsn(lsn),
                data: Bytes::from(data),
            });
        }

        let (fresh, delivered) = group_transactions(changes, stream.delivered)
            .map_err(|e| ReplicationError::Protocol(e.to_string()))?;
        if !fresh.is_empty() {
            debug!(
                "Fetched {} messages from slot {} up to {}",
                fresh.len(),
                stream.slot,
                delivered
            );
        }
        stream.pending.extend(fresh);
        stream.delivered = delivered;
        Ok(())
    }
}

#[async_trait]
impl ReplicationConnection for PgReplicationConnection {
    async fn is_in_recovery(&mut self) -> Result<bool, ReplicationError> {
        let row = self
            .client()?
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await?;
        Ok(row.get(0))
    }

    async fn renew_publication(&mut self, name: &str) -> Result<(), ReplicationError> {
        let ident = quote_ident(name);
        let client = self.client()?;
        let txn = client.transaction().await?;
        txn.batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {ident}; CREATE PUBLICATION {ident} FOR ALL TABLES"
        ))
        .await?;
        txn.commit().await?;
        info!("Renewed publication {name}");
        Ok(())
    }

    async fn get_replication_slot(&mut self, name: &str) -> Result<SlotInfo, ReplicationError> {
        let client = self.client()?;
        if let Err(e) = client
            .execute("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
        {
            debug!("Dropping stale replication slot {name} failed (ignored): {e}");
        }

        let consistent_point = self.create_slot(name).await?;
        let snapshot_name = self.export_snapshot().await?;
        self.slot_position = consistent_point;
        info!("Replication slot {name} at {consistent_point}, snapshot {snapshot_name}");

        Ok(SlotInfo {
            consistent_point,
            snapshot_name,
        })
    }

    async fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> Result<(), ReplicationError> {
        self.client()?;
        // Position zero continues from where the slot stands
        let position = if start_lsn.is_zero() {
            self.slot_position
        } else {
            start_lsn
        };
        info!("Starting replication on slot {slot} (publication {publication}) at {position}");
        self.stream = Some(Stream {
            slot: slot.to_string(),
            publication: publication.to_string(),
            pending: VecDeque::new(),
            delivered: position,
            acknowledged: self.slot_position,
        });
        Ok(())
    }

    async fn wait_for_replication_message(
        &mut self,
        timeout: Duration,
    ) -> Result<WalMessage, ReplicationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self
                .stream
                .as_mut()
                .and_then(|stream| stream.pending.pop_front())
            {
                return Ok(message);
            }

            self.poll().await?;
            if self
                .stream
                .as_ref()
                .is_some_and(|stream| !stream.pending.is_empty())
            {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReplicationError::Timeout(timeout));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn send_status(&mut self, received: Lsn, saved: Lsn) -> Result<(), ReplicationError> {
        let session = self.session.as_ref().ok_or(ReplicationError::Closed)?;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if saved <= stream.acknowledged {
            return Ok(());
        }

        session
            .client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2)",
                &[&stream.slot, &PgLsn::from(saved.as_u64())],
            )
            .await?;
        debug!(
            "Advanced slot {} to {} (received {})",
            stream.slot, saved, received
        );
        stream.acknowledged = saved;
        Ok(())
    }

    async fn do_in_transaction_snapshot(
        &mut self,
        snapshot_name: &str,
        body: &mut dyn SnapshotBody,
    ) -> Result<(), ReplicationError> {
        let client = self
            .session
            .as_mut()
            .map(|session| &mut session.client)
            .ok_or(ReplicationError::Closed)?;
        let txn = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;
        txn.batch_execute(&format!(
            "SET TRANSACTION SNAPSHOT {}",
            quote_literal(snapshot_name)
        ))
        .await?;

        let mut snapshot = PgSnapshot::new(&txn);
        let result = body.run(&mut snapshot).await;
        // The exported snapshot is no longer needed
        self.snapshot_holder = None;
        match result {
            Ok(()) => txn.commit().await?,
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!("Rollback of snapshot transaction failed: {rollback}");
                }
                return Err(ReplicationError::Snapshot(e));
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), ReplicationError> {
        self.stream = None;
        self.snapshot_holder = None;
        if self.session.take().is_some() {
            info!("Closed replication connection");
        }
        Ok(())
    }
}

fn to_lsn(lsn: PgLsn) -> Lsn {
    Lsn(u64::from(lsn))
}

/// Filters peeked changes down to whole transactions not yet delivered.
///
/// Peeking does not consume, so every poll sees all transactions since the
/// last slot advance. Groups run from `B` to `C`; a group whose commit end LSN
/// is at or below `delivered` was handed out before and is skipped. An
/// incomplete trailing group is left for the next poll.
///
/// Returns the new messages and the updated delivered position.
pub(crate) fn group_transactions(
    changes: Vec<WalMessage>,
    delivered: Lsn,
) -> Result<(Vec<WalMessage>, Lsn), DecodeError> {
    let mut fresh = Vec::new();
    let mut group = Vec::new();
    let mut delivered = delivered;

    for change in changes {
        let tag = change.data.first().copied();
        if tag == Some(b'B') && !group.is_empty() {
            warn!("Dropping unterminated transaction before {}", change.lsn);
            group.clear();
        }

        if tag != Some(b'C') {
            group.push(change);
            continue;
        }

        let end_lsn = match decode(&change.data)? {
            LogicalMessage::Commit(commit) => commit.end_lsn,
            _ => return Err(DecodeError::UnknownMessageType(b'C')),
        };
        group.push(change);
        if end_lsn > delivered {
            fresh.append(&mut group);
            delivered = end_lsn;
        } else {
            group.clear();
        }
    }

    Ok((fresh, delivered))
}

/// Quotes an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(lsn: u64) -> WalMessage {
        let mut data = vec![b'B'];
        data.extend_from_slice(&lsn.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        WalMessage {
            lsn: Lsn(lsn),
            data: Bytes::from(data),
        }
    }

    fn insert(lsn: u64) -> WalMessage {
        WalMessage {
            lsn: Lsn(lsn),
            data: Bytes::from_static(b"I\x00\x00\x00\x01N\x00\x00"),
        }
    }

    fn commit(lsn: u64, end_lsn: u64) -> WalMessage {
        let mut data = vec![b'C', 0];
        data.extend_from_slice(&lsn.to_be_bytes());
        data.extend_from_slice(&end_lsn.to_be_bytes());
        data.extend_from_slice(&0i64.to_be_bytes());
        WalMessage {
            lsn: Lsn(lsn),
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_group_transactions_skips_delivered() {
        let changes = vec![
            begin(0x10),
            insert(0x10),
            commit(0x18, 0x20),
            begin(0x30),
            insert(0x30),
            commit(0x38, 0x40),
        ];

        let (fresh, delivered) = group_transactions(changes.clone(), Lsn::ZERO).unwrap();
        assert_eq!(fresh.len(), 6);
        assert_eq!(delivered, Lsn(0x40));

        let (fresh, delivered) = group_transactions(changes, Lsn(0x20)).unwrap();
        assert_eq!(fresh.len(), 3);
        assert_eq!(fresh[0].lsn, Lsn(0x30));
        assert_eq!(delivered, Lsn(0x40));
    }

    #[test]
    fn test_group_transactions_keeps_incomplete_tail() {
        let changes = vec![begin(0x10), insert(0x10), commit(0x18, 0x20), begin(0x30)];
        let (fresh, delivered) = group_transactions(changes, Lsn::ZERO).unwrap();
        assert_eq!(fresh.len(), 3);
        assert_eq!(delivered, Lsn(0x20));
    }

    #[test]
    fn test_group_transactions_nothing_new() {
        let changes = vec![begin(0x10), commit(0x18, 0x20)];
        let (fresh, delivered) = group_transactions(changes, Lsn(0x20)).unwrap();
        assert!(fresh.is_empty());
        assert_eq!(delivered, Lsn(0x20));
    }

    #[test]
    fn test_server_lsn_conversion() {
        let server: PgLsn = "16/B374D848".parse().unwrap();
        let lsn = to_lsn(server);
        assert_eq!(lsn, Lsn((0x16 << 32) | 0xB374D848));
        assert_eq!(lsn.to_string(), server.to_string());
        assert_eq!(PgLsn::from(lsn.as_u64()), server);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("etcd_sync"), "\"etcd_sync\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("00000003-1"), "'00000003-1'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_refused_connection_is_temporary() {
        let config = Config::new("host=127.0.0.1 port=1 user=postgres connect_timeout=2").unwrap();
        match tokio_test::block_on(PgReplicationConnection::connect(config)) {
            Err(e) => assert!(e.is_temporary(), "unexpected error: {e}"),
            Ok(_) => panic!("Expected the connection to be refused"),
        }
    }
}

//! Shared helpers for the pipeline tests: `pgoutput` message builders and a
//! scripted replication connection.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_sync::{ResourceRegistry, SyncConfig};
use etcd_sync_pgoutput::value::oid;
use etcd_sync_pgoutput::{Column, Lsn, Relation};
use etcd_sync_postgresql::{
    ConnectionFactory, ReplicationConnection, ReplicationError, SlotInfo, SnapshotBody,
    SnapshotTransaction, WalMessage,
};
use etcd_sync_store::{KvStore, MemoryStore};

pub const VN_RELATION: u32 = 16384;
pub const NI_RELATION: u32 = 16390;
pub const REF_RELATION: u32 = 16400;

pub const REGISTRY: &str = r#"
resources:
  - table: vn
    kind: virtual_network
    fqn_column: fq_name
  - table: ni
    kind: network_ipam
references:
  - table: ref_vn_ni
    kind: virtual_network_network_ipam
    from_column: from
    to_column: to
    to_kind: network_ipam
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn registry() -> ResourceRegistry {
    ResourceRegistry::from_yaml_str(REGISTRY).unwrap()
}

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::from_yaml_str(
        r#"
root_path: /prefix
status_interval: 50ms
retry:
  max_attempts: 3
  initial_backoff: 10ms
  max_backoff: 20ms
"#,
    )
    .unwrap();
    config.dump = false;
    config
}

pub async fn stored(store: &MemoryStore, key: &str) -> Option<serde_json::Value> {
    store
        .get(key)
        .await
        .unwrap()
        .map(|kv| serde_json::from_slice(&kv.value).unwrap())
}

/// Waits until `key` holds `expected` (None: absent), for up to two seconds.
pub async fn wait_for_value(store: &MemoryStore, key: &str, expected: Option<serde_json::Value>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = stored(store, key).await;
        if current == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{key} is {current:?}, expected {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until `check` holds, for up to two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// Relations

pub fn vn_relation() -> Relation {
    relation(
        VN_RELATION,
        "vn",
        &[
            ("uuid", oid::TEXT, true),
            ("name", oid::TEXT, false),
            ("fq_name", oid::TEXT, false),
            ("mtu", oid::INT4, false),
        ],
    )
}

pub fn ni_relation() -> Relation {
    relation(
        NI_RELATION,
        "ni",
        &[
            ("uuid", oid::TEXT, true),
            ("name", oid::TEXT, false),
            ("fq_name", oid::TEXT, false),
        ],
    )
}

pub fn ref_relation() -> Relation {
    relation(
        REF_RELATION,
        "ref_vn_ni",
        &[
            ("from", oid::TEXT, true),
            ("to", oid::TEXT, true),
            ("attr", oid::JSONB, false),
        ],
    )
}

pub fn relation(id: u32, name: &str, columns: &[(&str, u32, bool)]) -> Relation {
    Relation {
        id,
        namespace: "public".to_string(),
        name: name.to_string(),
        replica_identity: b'd',
        columns: columns
            .iter()
            .map(|(name, type_oid, is_key)| Column {
                name: name.to_string(),
                type_oid: *type_oid,
                type_modifier: -1,
                is_key: *is_key,
            })
            .collect(),
    }
}

pub fn row(values: &[Option<&str>]) -> Vec<Option<String>> {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

// pgoutput payloads

fn cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn tuple(buf: &mut Vec<u8>, values: &[Option<&str>]) {
    tuple_with_unchanged(buf, values, &[]);
}

fn tuple_with_unchanged(buf: &mut Vec<u8>, values: &[Option<&str>], unchanged: &[usize]) {
    buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for (i, value) in values.iter().enumerate() {
        if unchanged.contains(&i) {
            buf.push(b'u');
            continue;
        }
        match value {
            Some(text) => {
                buf.push(b't');
                buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
            None => buf.push(b'n'),
        }
    }
}

pub fn relation_msg(relation: &Relation) -> Vec<u8> {
    let mut buf = vec![b'R'];
    buf.extend_from_slice(&relation.id.to_be_bytes());
    cstr(&mut buf, &relation.namespace);
    cstr(&mut buf, &relation.name);
    buf.push(relation.replica_identity);
    buf.extend_from_slice(&(relation.columns.len() as u16).to_be_bytes());
    for column in &relation.columns {
        buf.push(u8::from(column.is_key));
        cstr(&mut buf, &column.name);
        buf.extend_from_slice(&column.type_oid.to_be_bytes());
        buf.extend_from_slice(&column.type_modifier.to_be_bytes());
    }
    buf
}

pub fn begin_msg(final_lsn: u64, xid: u32) -> Vec<u8> {
    let mut buf = vec![b'B'];
    buf.extend_from_slice(&final_lsn.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf.extend_from_slice(&xid.to_be_bytes());
    buf
}

pub fn commit_msg(commit_lsn: u64, end_lsn: u64) -> Vec<u8> {
    let mut buf = vec![b'C', 0];
    buf.extend_from_slice(&commit_lsn.to_be_bytes());
    buf.extend_from_slice(&end_lsn.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf
}

pub fn insert_msg(relation_id: u32, values: &[Option<&str>]) -> Vec<u8> {
    let mut buf = vec![b'I'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(b'N');
    tuple(&mut buf, values);
    buf
}

pub fn update_msg(relation_id: u32, old_key: Option<&[Option<&str>]>, values: &[Option<&str>]) -> Vec<u8> {
    let mut buf = vec![b'U'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    if let Some(old) = old_key {
        buf.push(b'K');
        tuple(&mut buf, old);
    }
    buf.push(b'N');
    tuple(&mut buf, values);
    buf
}

/// Update whose columns at `unchanged` are sent as unchanged TOAST values.
pub fn update_toast_msg(relation_id: u32, values: &[Option<&str>], unchanged: &[usize]) -> Vec<u8> {
    let mut buf = vec![b'U'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(b'N');
    tuple_with_unchanged(&mut buf, values, unchanged);
    buf
}

pub fn delete_msg(relation_id: u32, key: &[Option<&str>]) -> Vec<u8> {
    let mut buf = vec![b'D'];
    buf.extend_from_slice(&relation_id.to_be_bytes());
    buf.push(b'K');
    tuple(&mut buf, key);
    buf
}

pub fn truncate_msg(relation_ids: &[u32]) -> Vec<u8> {
    let mut buf = vec![b'T'];
    buf.extend_from_slice(&(relation_ids.len() as u32).to_be_bytes());
    buf.push(0);
    for id in relation_ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

pub fn wal(lsn: u64, data: Vec<u8>) -> WalMessage {
    WalMessage {
        lsn: Lsn(lsn),
        data: Bytes::from(data),
    }
}

// Scripted connection

/// What a scripted connection observed
#[derive(Debug, Default)]
pub struct Probe {
    pub statuses: Vec<(Lsn, Lsn)>,
    pub publications: Vec<String>,
    pub snapshots: Vec<String>,
    pub started_at: Option<Lsn>,
    pub closed: bool,
}

/// Replication connection replaying a fixed list of messages.
///
/// Once the messages run out it reports timeouts, or `end` if set.
pub struct ScriptedConnection {
    pub in_recovery: bool,
    pub consistent_point: Lsn,
    pub tables: Vec<(Relation, Vec<Vec<Option<String>>>)>,
    pub messages: VecDeque<WalMessage>,
    pub end: Option<ReplicationError>,
    pub probe: Arc<Mutex<Probe>>,
    streaming: bool,
}

impl ScriptedConnection {
    pub fn new(messages: Vec<WalMessage>) -> Self {
        Self {
            in_recovery: false,
            consistent_point: Lsn(0x100),
            tables: Vec::new(),
            messages: messages.into(),
            end: None,
            probe: Arc::new(Mutex::new(Probe::default())),
            streaming: false,
        }
    }

    pub fn with_tables(mut self, tables: Vec<(Relation, Vec<Vec<Option<String>>>)>) -> Self {
        self.tables = tables;
        self
    }

    pub fn in_recovery(mut self) -> Self {
        self.in_recovery = true;
        self
    }

    pub fn ending_with(mut self, end: ReplicationError) -> Self {
        self.end = Some(end);
        self
    }

    pub fn probe(&self) -> Arc<Mutex<Probe>> {
        self.probe.clone()
    }
}

#[async_trait]
impl ReplicationConnection for ScriptedConnection {
    async fn is_in_recovery(&mut self) -> Result<bool, ReplicationError> {
        Ok(self.in_recovery)
    }

    async fn renew_publication(&mut self, name: &str) -> Result<(), ReplicationError> {
        self.probe.lock().unwrap().publications.push(name.to_string());
        Ok(())
    }

    async fn get_replication_slot(&mut self, name: &str) -> Result<SlotInfo, ReplicationError> {
        Ok(SlotInfo {
            consistent_point: self.consistent_point,
            snapshot_name: format!("{name}-snapshot"),
        })
    }

    async fn start_replication(
        &mut self,
        _slot: &str,
        _publication: &str,
        start_lsn: Lsn,
    ) -> Result<(), ReplicationError> {
        self.streaming = true;
        self.probe.lock().unwrap().started_at = Some(start_lsn);
        Ok(())
    }

    async fn wait_for_replication_message(
        &mut self,
        timeout: Duration,
    ) -> Result<WalMessage, ReplicationError> {
        if !self.streaming {
            return Err(ReplicationError::Closed);
        }
        if let Some(message) = self.messages.pop_front() {
            return Ok(message);
        }
        if let Some(end) = self.end.take() {
            return Err(end);
        }
        tokio::time::sleep(timeout).await;
        Err(ReplicationError::Timeout(timeout))
    }

    async fn send_status(&mut self, received: Lsn, saved: Lsn) -> Result<(), ReplicationError> {
        self.probe.lock().unwrap().statuses.push((received, saved));
        Ok(())
    }

    async fn do_in_transaction_snapshot(
        &mut self,
        snapshot_name: &str,
        body: &mut dyn SnapshotBody,
    ) -> Result<(), ReplicationError> {
        self.probe
            .lock()
            .unwrap()
            .snapshots
            .push(snapshot_name.to_string());
        let mut txn = ScriptedSnapshot {
            tables: &self.tables,
        };
        body.run(&mut txn).await.map_err(ReplicationError::Snapshot)
    }

    async fn close(&mut self) -> Result<(), ReplicationError> {
        self.streaming = false;
        self.probe.lock().unwrap().closed = true;
        Ok(())
    }
}

struct ScriptedSnapshot<'a> {
    tables: &'a [(Relation, Vec<Vec<Option<String>>>)],
}

#[async_trait]
impl SnapshotTransaction for ScriptedSnapshot<'_> {
    async fn tables(&mut self, _publication: &str) -> Result<Vec<Relation>, ReplicationError> {
        Ok(self.tables.iter().map(|(relation, _)| relation.clone()).collect())
    }

    async fn rows(
        &mut self,
        relation: &Relation,
    ) -> Result<Vec<Vec<Option<String>>>, ReplicationError> {
        self.tables
            .iter()
            .find(|(r, _)| r.id == relation.id)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| ReplicationError::Protocol(format!("no table {}", relation.name)))
    }
}

/// Hands out scripted connections in order; fails fatally when exhausted.
#[derive(Default)]
pub struct ScriptedFactory {
    connections: Mutex<VecDeque<ScriptedConnection>>,
    pub connects: Arc<Mutex<usize>>,
}

impl ScriptedFactory {
    pub fn new(connections: Vec<ScriptedConnection>) -> Self {
        Self {
            connections: Mutex::new(connections.into()),
            connects: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, ReplicationError> {
        *self.connects.lock().unwrap() += 1;
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ReplicationError::Closed)
    }
}

pub fn memory_store() -> (Arc<MemoryStore>, Arc<dyn KvStore>) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn KvStore> = store.clone();
    (store, dyn_store)
}

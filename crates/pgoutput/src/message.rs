//! Typed `pgoutput` messages

use bytes::Bytes;

use crate::{Lsn, Relation};

/// A decoded logical replication message.
///
/// The replication handler matches on this exhaustively at a single
/// dispatch point.
#[derive(Debug, Clone)]
pub enum LogicalMessage {
    Begin(Begin),
    Commit(Commit),
    Origin(Origin),
    Relation(Relation),
    Type(TypeInfo),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Truncate(Truncate),
}

impl LogicalMessage {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalMessage::Begin(_) => "begin",
            LogicalMessage::Commit(_) => "commit",
            LogicalMessage::Origin(_) => "origin",
            LogicalMessage::Relation(_) => "relation",
            LogicalMessage::Type(_) => "type",
            LogicalMessage::Insert(_) => "insert",
            LogicalMessage::Update(_) => "update",
            LogicalMessage::Delete(_) => "delete",
            LogicalMessage::Truncate(_) => "truncate",
        }
    }
}

/// BEGIN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    /// LSN of the commit record of this transaction
    pub final_lsn: Lsn,
    /// Commit timestamp, microseconds since 2000-01-01
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub flags: u8,
    pub commit_lsn: Lsn,
    /// End of the transaction in the WAL; the position to acknowledge
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

/// ORIGIN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub commit_lsn: Lsn,
    pub name: String,
}

/// TYPE message, sent for user-defined types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

/// INSERT message
#[derive(Debug, Clone)]
pub struct Insert {
    pub relation_id: u32,
    pub tuple: Tuple,
}

/// UPDATE message
///
/// `old_tuple` is present when the replica identity changed (`K`) or the
/// table uses `REPLICA IDENTITY FULL` (`O`).
#[derive(Debug, Clone)]
pub struct Update {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

/// DELETE message
#[derive(Debug, Clone)]
pub struct Delete {
    pub relation_id: u32,
    pub old_tuple: Tuple,
}

/// TRUNCATE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncate {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

/// Row tuple as sent on the wire
#[derive(Debug, Clone, Default)]
pub struct Tuple(pub Vec<TupleData>);

impl Tuple {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Column data within a tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleData {
    /// NULL value
    Null,
    /// Unchanged TOASTed value; the actual value is not sent
    Unchanged,
    /// Text representation
    Text(Bytes),
}

impl TupleData {
    /// Builds a text datum; mostly useful for tests and snapshot rows.
    pub fn text(value: impl Into<String>) -> Self {
        TupleData::Text(Bytes::from(value.into()))
    }
}

impl From<Option<String>> for TupleData {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(v) => TupleData::text(v),
            None => TupleData::Null,
        }
    }
}

use thiserror::Error;

/// Errors raised while decoding `pgoutput` messages and row tuples.
///
/// Every variant is fatal for the message being decoded: a change that
/// cannot be decoded cannot be skipped without diverging from the source.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Message truncated: needed {needed} more bytes while reading {context}")]
    Truncated { context: &'static str, needed: usize },

    #[error("Empty message")]
    Empty,

    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Unexpected tuple marker {marker:?} in {context}")]
    UnexpectedMarker { context: &'static str, marker: char },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Unknown relation id {0}: relation message must precede row messages")]
    UnknownRelation(u32),

    #[error("Row for relation {relation} has {actual} columns, relation declares {expected}")]
    ColumnCountMismatch {
        relation: String,
        expected: usize,
        actual: usize,
    },

    #[error("Row for relation {0} has no primary key columns")]
    MissingPrimaryKey(String),

    #[error("Primary key column {column} of relation {relation} is null")]
    NullPrimaryKey { relation: String, column: String },

    #[error("Failed to decode column {column} (type oid {type_oid}): {reason}")]
    InvalidValue {
        column: String,
        type_oid: u32,
        reason: String,
    },
}

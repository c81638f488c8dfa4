//! Decoder for the PostgreSQL `pgoutput` logical replication protocol
//!
//! This library turns the binary payload of WAL data messages into typed
//! messages and decodes row tuples into column-name-to-value maps.
//!
//! # Decoding a stream
//!
//! ```ignore
//! use etcd_sync_pgoutput::{decode, LogicalMessage, RelationSet};
//!
//! let mut relations = RelationSet::default();
//! match decode(&payload)? {
//!     LogicalMessage::Relation(relation) => relations.insert(relation),
//!     LogicalMessage::Insert(insert) => {
//!         let row = relations.decode_row(insert.relation_id, &insert.tuple)?;
//!         println!("{:?} -> {:?}", row.primary_key, row.values);
//!     }
//!     _ => {}
//! }
//! ```
//!
//! Relation metadata is owned by the caller. A `Relation` message must be
//! seen before any row message that references its id.

mod decoder;
mod error;
mod lsn;
mod message;
mod relation;
pub mod value;

pub use decoder::decode;
pub use error::DecodeError;
pub use lsn::Lsn;
pub use message::{
    Begin, Commit, Delete, Insert, LogicalMessage, Origin, Truncate, Tuple, TupleData, TypeInfo,
    Update,
};
pub use relation::{Column, DecodedRow, Relation, RelationSet};

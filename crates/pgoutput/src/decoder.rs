//! Binary decoding of `pgoutput` protocol version 1 messages

use bytes::{Buf, Bytes};

use crate::message::*;
use crate::{Column, DecodeError, Lsn, Relation};

/// Decodes a single `pgoutput` message from the WAL data payload.
///
/// All reads are bounds-checked: a short buffer yields
/// [`DecodeError::Truncated`] instead of panicking.
pub fn decode(payload: &[u8]) -> Result<LogicalMessage, DecodeError> {
    let mut reader = Reader::new(Bytes::copy_from_slice(payload));
    if reader.is_empty() {
        return Err(DecodeError::Empty);
    }

    let tag = reader.u8("message type")?;
    match tag {
        b'B' => decode_begin(&mut reader).map(LogicalMessage::Begin),
        b'C' => decode_commit(&mut reader).map(LogicalMessage::Commit),
        b'O' => decode_origin(&mut reader).map(LogicalMessage::Origin),
        b'R' => decode_relation(&mut reader).map(LogicalMessage::Relation),
        b'Y' => decode_type(&mut reader).map(LogicalMessage::Type),
        b'I' => decode_insert(&mut reader).map(LogicalMessage::Insert),
        b'U' => decode_update(&mut reader).map(LogicalMessage::Update),
        b'D' => decode_delete(&mut reader).map(LogicalMessage::Delete),
        b'T' => decode_truncate(&mut reader).map(LogicalMessage::Truncate),
        other => Err(DecodeError::UnknownMessageType(other)),
    }
}

fn decode_begin(r: &mut Reader) -> Result<Begin, DecodeError> {
    Ok(Begin {
        final_lsn: Lsn(r.u64("begin final lsn")?),
        timestamp: r.i64("begin timestamp")?,
        xid: r.u32("begin xid")?,
    })
}

fn decode_commit(r: &mut Reader) -> Result<Commit, DecodeError> {
    Ok(Commit {
        flags: r.u8("commit flags")?,
        commit_lsn: Lsn(r.u64("commit lsn")?),
        end_lsn: Lsn(r.u64("commit end lsn")?),
        timestamp: r.i64("commit timestamp")?,
    })
}

fn decode_origin(r: &mut Reader) -> Result<Origin, DecodeError> {
    Ok(Origin {
        commit_lsn: Lsn(r.u64("origin lsn")?),
        name: r.cstring("origin name")?,
    })
}

fn decode_relation(r: &mut Reader) -> Result<Relation, DecodeError> {
    let id = r.u32("relation id")?;
    let namespace = r.cstring("relation namespace")?;
    let name = r.cstring("relation name")?;
    let replica_identity = r.u8("relation replica identity")?;
    let column_count = r.u16("relation column count")?;

    let mut columns = Vec::with_capacity(usize::from(column_count));
    for _ in 0..column_count {
        let flags = r.u8("column flags")?;
        let column_name = r.cstring("column name")?;
        let type_oid = r.u32("column type oid")?;
        let type_modifier = r.i32("column type modifier")?;
        columns.push(Column {
            name: column_name,
            type_oid,
            type_modifier,
            is_key: flags & 0x01 != 0,
        });
    }

    Ok(Relation {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_type(r: &mut Reader) -> Result<TypeInfo, DecodeError> {
    Ok(TypeInfo {
        id: r.u32("type oid")?,
        namespace: r.cstring("type namespace")?,
        name: r.cstring("type name")?,
    })
}

fn decode_insert(r: &mut Reader) -> Result<Insert, DecodeError> {
    let relation_id = r.u32("insert relation id")?;
    expect_marker(r, b'N', "insert")?;
    let tuple = decode_tuple(r)?;
    Ok(Insert { relation_id, tuple })
}

fn decode_update(r: &mut Reader) -> Result<Update, DecodeError> {
    let relation_id = r.u32("update relation id")?;
    let marker = r.u8("update tuple marker")?;

    let old_tuple = match marker {
        b'K' | b'O' => {
            let old = decode_tuple(r)?;
            expect_marker(r, b'N', "update")?;
            Some(old)
        }
        b'N' => None,
        other => {
            return Err(DecodeError::UnexpectedMarker {
                context: "update",
                marker: char::from(other),
            })
        }
    };
    let new_tuple = decode_tuple(r)?;

    Ok(Update {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(r: &mut Reader) -> Result<Delete, DecodeError> {
    let relation_id = r.u32("delete relation id")?;
    match r.u8("delete tuple marker")? {
        b'K' | b'O' => {}
        other => {
            return Err(DecodeError::UnexpectedMarker {
                context: "delete",
                marker: char::from(other),
            })
        }
    }
    let old_tuple = decode_tuple(r)?;
    Ok(Delete {
        relation_id,
        old_tuple,
    })
}

fn decode_truncate(r: &mut Reader) -> Result<Truncate, DecodeError> {
    let relation_count = r.u32("truncate relation count")?;
    let options = r.u8("truncate options")?;
    let mut relation_ids = Vec::new();
    for _ in 0..relation_count {
        relation_ids.push(r.u32("truncate relation id")?);
    }
    Ok(Truncate {
        options,
        relation_ids,
    })
}

fn decode_tuple(r: &mut Reader) -> Result<Tuple, DecodeError> {
    let column_count = r.u16("tuple column count")?;
    let mut columns = Vec::with_capacity(usize::from(column_count));
    for _ in 0..column_count {
        let datum = match r.u8("tuple datum kind")? {
            b'n' => TupleData::Null,
            b'u' => TupleData::Unchanged,
            b't' | b'b' => {
                let len = r.u32("tuple datum length")? as usize;
                TupleData::Text(r.bytes(len, "tuple datum")?)
            }
            other => {
                return Err(DecodeError::UnexpectedMarker {
                    context: "tuple datum",
                    marker: char::from(other),
                })
            }
        };
        columns.push(datum);
    }
    Ok(Tuple(columns))
}

fn expect_marker(r: &mut Reader, expected: u8, context: &'static str) -> Result<(), DecodeError> {
    let marker = r.u8("tuple marker")?;
    if marker != expected {
        return Err(DecodeError::UnexpectedMarker {
            context,
            marker: char::from(marker),
        });
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a message payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn ensure(&self, needed: usize, context: &'static str) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                context,
                needed: needed - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        self.ensure(1, context)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, DecodeError> {
        self.ensure(2, context)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        self.ensure(4, context)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, context: &'static str) -> Result<i32, DecodeError> {
        self.ensure(4, context)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self, context: &'static str) -> Result<u64, DecodeError> {
        self.ensure(8, context)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, context: &'static str) -> Result<i64, DecodeError> {
        self.ensure(8, context)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self, len: usize, context: &'static str) -> Result<Bytes, DecodeError> {
        self.ensure(len, context)?;
        Ok(self.buf.split_to(len))
    }

    fn cstring(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::Truncated { context, needed: 1 })?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(context))
    }
}

//! Binary decoder for replication frames and pgoutput message bodies.
//!
//! All multi-byte integers are big-endian. Reads are bounds-checked so a
//! truncated frame surfaces as a typed error for the driver to log and
//! skip; it never panics and never tears down the connection.

use bytes::Bytes;
use riptide_core::Lsn;
use thiserror::Error;

use super::message::{
    Begin, Commit, Delete, Insert, LogicalMessage, Relation, RelationColumn, ReplicationFrame,
    TupleData, TupleValue, Update,
};

/// Decoder errors.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("unexpected end of frame at offset {offset}, need {needed} more bytes")]
    UnexpectedEof { offset: usize, needed: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown replication frame tag 0x{0:02X}")]
    UnknownFrameTag(u8),

    #[error("invalid utf-8 at offset {0}")]
    InvalidUtf8(usize),

    #[error("unterminated string at offset {0}")]
    UnterminatedString(usize),

    #[error("unexpected tuple section tag 0x{0:02X}")]
    UnexpectedTupleTag(u8),

    #[error("unknown column tag 0x{0:02X}")]
    UnknownColumnTag(u8),
}

/// Bounds-checked cursor over one frame.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.data.len() - self.pos;
        if remaining < len {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                needed: len - remaining,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let offset = self.pos;
        self.take(N)?
            .try_into()
            .map_err(|_| DecodeError::UnexpectedEof { offset, needed: N })
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn lsn(&mut self) -> Result<Lsn, DecodeError> {
        Ok(Lsn::new(self.u64()?))
    }

    /// Null-terminated UTF-8 string.
    fn cstring(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let nul = self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedString(start))?;
        let s = std::str::from_utf8(&self.data[start..start + nul])
            .map_err(|_| DecodeError::InvalidUtf8(start))?
            .to_string();
        self.pos = start + nul + 1;
        Ok(s)
    }
}

/// Parses the payload of a CopyData message into a replication frame.
pub fn decode_frame(data: &[u8]) -> Result<ReplicationFrame, DecodeError> {
    let mut r = Reader::new(data);
    let tag = r.u8().map_err(|_| DecodeError::EmptyFrame)?;

    match tag {
        b'w' => {
            let wal_start = r.lsn()?;
            let wal_end = r.lsn()?;
            let server_clock = r.i64()?;
            let body = Bytes::copy_from_slice(&data[r.pos..]);
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                server_clock,
                body,
            })
        }
        b'k' => {
            let wal_end = r.lsn()?;
            let server_clock = r.i64()?;
            let reply_requested = r.u8()? != 0;
            Ok(ReplicationFrame::Keepalive {
                wal_end,
                server_clock,
                reply_requested,
            })
        }
        other => Err(DecodeError::UnknownFrameTag(other)),
    }
}

/// Parses a pgoutput logical message body.
///
/// Tags the driver has no use for decode to [`LogicalMessage::Skipped`]
/// for forward compatibility.
pub fn decode_logical(data: &[u8]) -> Result<LogicalMessage, DecodeError> {
    let mut r = Reader::new(data);
    let tag = r.u8().map_err(|_| DecodeError::EmptyFrame)?;

    match tag {
        b'B' => Ok(LogicalMessage::Begin(Begin {
            final_lsn: r.lsn()?,
            commit_clock: r.i64()?,
            xid: r.u32()?,
        })),
        b'C' => Ok(LogicalMessage::Commit(Commit {
            flags: r.u8()?,
            commit_lsn: r.lsn()?,
            end_lsn: r.lsn()?,
            commit_clock: r.i64()?,
        })),
        b'R' => decode_relation(&mut r).map(LogicalMessage::Relation),
        b'I' => {
            let relation_oid = r.u32()?;
            let section = r.u8()?;
            if section != b'N' {
                return Err(DecodeError::UnexpectedTupleTag(section));
            }
            let new_tuple = decode_tuple(&mut r)?;
            Ok(LogicalMessage::Insert(Insert {
                relation_oid,
                new_tuple,
            }))
        }
        b'U' => decode_update(&mut r).map(LogicalMessage::Update),
        b'D' => {
            let relation_oid = r.u32()?;
            let section = r.u8()?;
            if section != b'K' && section != b'O' {
                return Err(DecodeError::UnexpectedTupleTag(section));
            }
            let old_tuple = decode_tuple(&mut r)?;
            Ok(LogicalMessage::Delete(Delete {
                relation_oid,
                old_tuple,
            }))
        }
        other => Ok(LogicalMessage::Skipped(other)),
    }
}

fn decode_relation(r: &mut Reader<'_>) -> Result<Relation, DecodeError> {
    let oid = r.u32()?;
    let namespace = r.cstring()?;
    let name = r.cstring()?;
    let replica_identity = r.u8()?;
    let num_columns = r.u16()?;

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        columns.push(RelationColumn {
            flags: r.u8()?,
            name: r.cstring()?,
            type_oid: r.u32()?,
            type_modifier: r.i32()?,
        });
    }

    Ok(Relation {
        oid,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_update(r: &mut Reader<'_>) -> Result<Update, DecodeError> {
    let relation_oid = r.u32()?;
    // Updates carry a discriminator before the new-tuple marker: an old
    // tuple section ('O' full row, 'K' key only) or directly 'N'.
    let (old_tuple, new_tuple) = match r.u8()? {
        b'N' => (None, decode_tuple(r)?),
        b'O' | b'K' => {
            let old = decode_tuple(r)?;
            let next = r.u8()?;
            if next != b'N' {
                return Err(DecodeError::UnexpectedTupleTag(next));
            }
            (Some(old), decode_tuple(r)?)
        }
        other => return Err(DecodeError::UnexpectedTupleTag(other)),
    };

    Ok(Update {
        relation_oid,
        old_tuple,
        new_tuple,
    })
}

fn decode_tuple(r: &mut Reader<'_>) -> Result<TupleData, DecodeError> {
    let num_columns = r.u16()?;
    let mut columns = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        let value = match r.u8()? {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            b't' => {
                let len = r.u32()? as usize;
                let offset = r.pos;
                let bytes = r.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::InvalidUtf8(offset))?
                    .to_string();
                TupleValue::Text(text)
            }
            other => return Err(DecodeError::UnknownColumnTag(other)),
        };
        columns.push(value);
    }

    Ok(TupleData { columns })
}

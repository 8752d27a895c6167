//! Typed messages for the logical replication stream.

use bytes::Bytes;
use riptide_core::Lsn;

/// Outer replication frame carried in a CopyData envelope.
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    /// WAL payload (`'w'`): position header plus a logical message body.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        /// Server clock, microseconds since the Postgres epoch.
        server_clock: i64,
        body: Bytes,
    },
    /// Primary keepalive (`'k'`). When `reply_requested` is set the
    /// server expects a standby status update promptly.
    Keepalive {
        wal_end: Lsn,
        server_clock: i64,
        reply_requested: bool,
    },
}

/// Decoded pgoutput message body.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin(Begin),
    Commit(Commit),
    Relation(Relation),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    /// Any tag the decoder does not interpret (origin, type, truncate,
    /// streaming-protocol messages). Retained so the driver can ignore
    /// them without treating the frame as malformed.
    Skipped(u8),
}

/// Transaction begin marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    pub final_lsn: Lsn,
    pub commit_clock: i64,
    pub xid: u32,
}

/// Transaction commit marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_clock: i64,
}

/// Table definition, sent before the first change for each relation.
/// Columns are matched to the change-feed schema by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

/// One column of a relation definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    /// Part of the replica identity key.
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// Row insert: the new tuple only.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub relation_oid: u32,
    pub new_tuple: TupleData,
}

/// Row update. The old tuple is present under REPLICA IDENTITY FULL
/// (`'O'`) or key-only identity (`'K'`).
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub relation_oid: u32,
    pub old_tuple: Option<TupleData>,
    pub new_tuple: TupleData,
}

/// Row delete: the old tuple (full row under REPLICA IDENTITY FULL).
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub relation_oid: u32,
    pub old_tuple: TupleData,
}

/// Column values of one tuple section, in ordinal order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TupleData {
    pub columns: Vec<TupleValue>,
}

/// A single column value on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    /// SQL NULL, no bytes.
    Null,
    /// Unchanged TOAST datum; the value was not sent.
    UnchangedToast,
    /// Text-format value.
    Text(String),
}

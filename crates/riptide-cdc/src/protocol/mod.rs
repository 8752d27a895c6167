//! The replication wire protocol.
//!
//! Frames arrive as CopyData payloads tagged `'w'` (WAL data) or `'k'`
//! (keepalive); WAL payloads carry pgoutput logical messages. Everything
//! here is byte-compatible with the `pgoutput` plugin at protocol
//! version 1.

pub mod client;
pub mod decoder;
pub mod message;

pub use client::{ReplicationClient, ReplicationStream};
pub use decoder::{decode_frame, decode_logical, DecodeError};
pub use message::{
    Begin, Commit, Delete, Insert, LogicalMessage, Relation, RelationColumn, ReplicationFrame,
    TupleData, TupleValue, Update,
};

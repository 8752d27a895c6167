//! Core state for the riptide realtime fan-out service.
//!
//! This crate owns the materialized view of the change-feed table: the
//! record map with its secondary indexes, the subscriber registry with
//! filtered fan-out, the per-record recent-event rings used for resume,
//! and the durable snapshot codec.
//!
//! The replication driver (in `riptide-cdc`) is the single writer; the
//! HTTP layer (in `riptided`) attaches subscribers and serves their
//! queues. All of them share one [`StateEngine`] handle.

pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod lsn;
pub mod run;
pub mod snapshot;

pub use engine::{StateEngine, Subscription, QUEUE_CAPACITY, RING_CAPACITY};
pub use error::{CoreError, Result};
pub use event::{EventKind, StreamEvent};
pub use filter::RunFilter;
pub use lsn::{Checkpoint, Lsn};
pub use run::{Change, ChangeOp, ColumnValue, RunState, DELETED_STATUS};
pub use snapshot::{Snapshot, SnapshotStore};

//! Postgres logical replication for the riptide service.
//!
//! Three layers, lowest first:
//!
//! - [`protocol`] — the wire format: replication frames inside CopyData
//!   envelopes and the pgoutput logical message bodies, plus the
//!   replication-mode client that speaks them over TCP.
//! - [`row`] — mapping decoded tuples onto [`riptide_core::RunState`]
//!   records, with the column coercions the change-feed table needs.
//! - [`driver`] — slot and publication management and the frame pump that
//!   feeds the state engine.

pub mod driver;
pub mod error;
pub mod protocol;
pub mod row;

pub use driver::{ReplicationConfig, ReplicationDriver};
pub use error::{CdcError, Result};

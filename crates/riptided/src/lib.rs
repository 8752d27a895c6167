//! Riptide daemon: the HTTP surface and background tasks around the
//! shared state engine.
//!
//! Three long-lived tasks cooperate over one [`riptide_core::StateEngine`]
//! handle: the replication driver (sole mutator), the periodic snapshot
//! worker, and the axum server that turns subscriber queues into
//! server-sent-event streams.

pub mod admission;
pub mod config;
pub mod server;
pub mod snapshots;
pub mod stream;

pub use admission::{AdmissionCounter, AdmissionPermit};
pub use config::{Config, ConfigError};
pub use server::{router, AppState};

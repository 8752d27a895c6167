//! The materialized record for one change-feed row.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lsn::Lsn;

/// Status value a delete-origin change leaves behind.
pub const DELETED_STATUS: &str = "deleted";

/// A decoded column value from the upstream row.
///
/// Serialized transparently as an optional string so the `data` map reads
/// naturally in JSON (`null` / `"text"`) and stays stable in the snapshot
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ColumnValue {
    Null,
    Text(String),
}

impl ColumnValue {
    /// Returns the text value, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            ColumnValue::Null => None,
        }
    }

    /// Returns `true` for a SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

impl From<Option<String>> for ColumnValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) => ColumnValue::Text(s),
            None => ColumnValue::Null,
        }
    }
}

impl From<ColumnValue> for Option<String> {
    fn from(value: ColumnValue) -> Self {
        match value {
            ColumnValue::Text(s) => Some(s),
            ColumnValue::Null => None,
        }
    }
}

/// One row of the change-feed table as held in the materialized view.
///
/// `seq` is assigned by the state engine at ingest and is strictly
/// increasing across all records. The typed fields are extracted from the
/// decoded columns; `data` retains every decoded column by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub id: Uuid,
    pub env_id: Uuid,
    #[serde(default)]
    pub tags: HashSet<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub data: HashMap<String, ColumnValue>,
}

impl RunState {
    /// Whether a delete-origin change has marked this record terminal.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.status == DELETED_STATUS
    }
}

/// Origin of a change on the replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A typed change decoded from the replication stream.
///
/// Deletes carry the old row with `status = "deleted"`.
#[derive(Debug, Clone)]
pub struct Change {
    pub op: ChangeOp,
    pub row: RunState,
    pub lsn: Lsn,
}

//! Mapping decoded tuples onto [`RunState`] records.
//!
//! Columns are matched to the change-feed schema by the names declared in
//! the cached relation message. Coercion failures drop the affected field
//! and fall back to a sane default; they never reject the whole change.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use riptide_core::{ColumnValue, RunState, DELETED_STATUS};
use tracing::warn;
use uuid::Uuid;

use crate::protocol::{Relation, TupleData, TupleValue};

/// Builds a record from one tuple section. `deleted` marks the row as a
/// tombstone regardless of its status column.
pub fn row_from_tuple(tuple: &TupleData, relation: &Relation, deleted: bool) -> RunState {
    let mut data: HashMap<String, ColumnValue> = HashMap::new();

    for (index, value) in tuple.columns.iter().enumerate() {
        let Some(column) = relation.columns.get(index) else {
            warn!(
                index,
                relation = %relation.name,
                "tuple has more columns than the cached relation, possible schema drift"
            );
            continue;
        };
        match value {
            TupleValue::Null => {
                data.insert(column.name.clone(), ColumnValue::Null);
            }
            TupleValue::Text(text) => {
                data.insert(column.name.clone(), ColumnValue::Text(text.clone()));
            }
            // The value was not sent; leave the field out rather than
            // overwriting it with null.
            TupleValue::UnchangedToast => {}
        }
    }

    let text = |name: &str| data.get(name).and_then(ColumnValue::as_text);
    let ingested_at = Utc::now();

    let id = text("id")
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::nil);
    let env_id = text("env_id")
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::nil);
    let status = if deleted {
        DELETED_STATUS.to_string()
    } else {
        text("status").unwrap_or_default().to_string()
    };
    let created_at = text("created_at")
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::UNIX_EPOCH);
    let updated_at = text("updated_at")
        .and_then(parse_timestamp)
        .unwrap_or(ingested_at);
    let tags = text("tags").map(parse_tags).unwrap_or_default();

    RunState {
        id,
        env_id,
        tags,
        status,
        created_at,
        updated_at,
        seq: 0,
        data,
    }
}

/// RFC 3339 first, then the `timestamptz` text form Postgres actually
/// emits (`2024-01-01 00:00:00.123+00`).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Tags arrive either as a JSON array of UUID strings or as a Postgres
/// array literal (`{a,b}`). Anything unparseable yields the empty set.
fn parse_tags(raw: &str) -> HashSet<Uuid> {
    if let Ok(values) = serde_json::from_str::<Vec<String>>(raw) {
        return values
            .iter()
            .filter_map(|value| Uuid::parse_str(value).ok())
            .collect();
    }

    let trimmed = raw.trim();
    if let Some(inner) = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    {
        return inner
            .split(',')
            .filter_map(|part| Uuid::parse_str(part.trim().trim_matches('"')).ok())
            .collect();
    }

    HashSet::new()
}

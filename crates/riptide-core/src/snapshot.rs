//! Durable snapshots of the materialized view.
//!
//! A snapshot is a postcard-encoded, zstd-compressed copy of the record
//! map plus the replication resume position and sequence counter. Writes
//! go to a sibling temp file first; the rename onto the live path is the
//! commit point, so a partially written file is never observed as valid.
//! Any load failure is equivalent to "no snapshot".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::run::RunState;

const ZSTD_LEVEL: i32 = 3;

/// Ceiling for the decompressed snapshot, guarding against a corrupt
/// length header allocating unbounded memory.
const MAX_SNAPSHOT_BYTES: usize = 256 * 1024 * 1024;

/// The durable artifact: everything needed to resume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: HashMap<Uuid, RunState>,
    pub lsn: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// Reads and atomically rotates the snapshot file at a fixed path.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encodes, compresses, and rotates the snapshot into place.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = postcard::to_allocvec(snapshot)?;
        let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)
            .map_err(|e| CoreError::Compression(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &compressed)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Loads the snapshot, treating a missing or undecodable file as cold
    /// start.
    pub fn load(&self) -> Option<Snapshot> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read snapshot");
                return None;
            }
        };

        let decoded = match zstd::bulk::decompress(&bytes, MAX_SNAPSHOT_BYTES) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot decompression failed, starting cold");
                return None;
            }
        };

        match postcard::from_bytes(&decoded) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot decode failed, starting cold");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ColumnValue;
    use std::collections::HashSet;

    fn sample_snapshot() -> Snapshot {
        let id = Uuid::new_v4();
        let mut data = HashMap::new();
        data.insert("status".to_string(), ColumnValue::Text("QUEUED".into()));
        data.insert("error".to_string(), ColumnValue::Null);

        let run = RunState {
            id,
            env_id: Uuid::new_v4(),
            tags: [Uuid::new_v4()].into_iter().collect::<HashSet<_>>(),
            status: "QUEUED".to_string(),
            created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
            updated_at: "2024-01-02T00:00:00Z".parse().unwrap(),
            seq: 7,
            data,
        };

        let mut records = HashMap::new();
        records.insert(id, run);

        Snapshot {
            records,
            lsn: "1/6B377A80".to_string(),
            timestamp: Utc::now(),
            sequence: 7,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.bin"));

        let snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.lsn, snapshot.lsn);
        assert_eq!(loaded.sequence, snapshot.sequence);
        assert_eq!(loaded.records, snapshot.records);
    }

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.bin"));
        assert!(store.load().is_none());
    }

    #[test]
    fn corrupt_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        std::fs::write(&path, b"definitely not a snapshot").unwrap();

        let store = SnapshotStore::new(path);
        assert!(store.load().is_none());
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.bin"));

        let mut snapshot = sample_snapshot();
        store.save(&snapshot).unwrap();

        snapshot.sequence = 99;
        snapshot.lsn = "2/0".to_string();
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.sequence, 99);
        assert_eq!(loaded.lsn, "2/0");
        // No stray temp file after a completed rotation.
        assert!(!store.path().with_extension("tmp").exists());
    }
}

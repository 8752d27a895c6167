//! The periodic snapshot worker.
//!
//! Every tick, if a replication resume position is known, copies the
//! record map out of the engine and rotates the durable snapshot. A
//! failed cycle is logged and retried on the next tick; the last good
//! snapshot stays on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use riptide_core::{Checkpoint, Lsn, Snapshot, SnapshotStore, StateEngine};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Snapshot cadence.
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Restores state from disk at startup. Returns the resume position when
/// a usable snapshot was found; anything else is a cold start.
pub fn restore_at_startup(
    store: &SnapshotStore,
    engine: &StateEngine,
    checkpoint: &Checkpoint,
) -> Option<Lsn> {
    let snapshot = store.load()?;
    let lsn = match snapshot.lsn.parse::<Lsn>() {
        Ok(lsn) => lsn,
        Err(e) => {
            warn!(error = %e, "snapshot has an unusable resume position, starting cold");
            return None;
        }
    };

    info!(
        records = snapshot.records.len(),
        sequence = snapshot.sequence,
        lsn = %lsn,
        "restored snapshot"
    );
    engine.restore(snapshot);
    checkpoint.advance(lsn);
    Some(lsn)
}

/// Runs until shutdown. Only one cycle is ever in flight: this task is
/// the sole writer of the snapshot file.
pub async fn run_snapshot_worker(
    engine: Arc<StateEngine>,
    checkpoint: Arc<Checkpoint>,
    store: SnapshotStore,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(lsn) = checkpoint.get() else {
                    debug!("no resume position yet, skipping snapshot");
                    continue;
                };

                let (records, sequence) = engine.export();
                let snapshot = Snapshot {
                    records,
                    lsn: lsn.to_string(),
                    timestamp: Utc::now(),
                    sequence,
                };

                match store.save(&snapshot) {
                    Ok(()) => debug!(
                        records = snapshot.records.len(),
                        sequence,
                        lsn = %lsn,
                        "snapshot written"
                    ),
                    Err(e) => warn!(error = %e, "snapshot write failed, will retry next tick"),
                }
            }
            _ = shutdown.recv() => {
                info!("snapshot worker stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_core::{Change, ChangeOp, RunFilter, RunState};
    use std::collections::{HashMap, HashSet};
    use uuid::Uuid;

    fn insert(id: Uuid, env: Uuid) -> Change {
        let now = Utc::now();
        Change {
            op: ChangeOp::Insert,
            row: RunState {
                id,
                env_id: env,
                tags: HashSet::new(),
                status: "QUEUED".to_string(),
                created_at: now,
                updated_at: now,
                seq: 0,
                data: HashMap::new(),
            },
            lsn: Lsn::new(7),
        }
    }

    #[test]
    fn restore_round_trips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.bin"));

        let engine = StateEngine::new();
        let env = Uuid::new_v4();
        engine.apply(insert(Uuid::new_v4(), env));

        let (records, sequence) = engine.export();
        store
            .save(&Snapshot {
                records,
                lsn: Lsn::new(0xABCD).to_string(),
                timestamp: Utc::now(),
                sequence,
            })
            .unwrap();

        let restarted = StateEngine::new();
        let checkpoint = Checkpoint::new();
        let lsn = restore_at_startup(&store, &restarted, &checkpoint).unwrap();

        assert_eq!(lsn, Lsn::new(0xABCD));
        assert_eq!(checkpoint.get(), Some(Lsn::new(0xABCD)));
        assert_eq!(
            restarted
                .matching_runs(&RunFilter {
                    env_id: Some(env),
                    ..Default::default()
                })
                .len(),
            1
        );
    }

    #[test]
    fn missing_snapshot_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent.bin"));
        let engine = StateEngine::new();
        let checkpoint = Checkpoint::new();

        assert!(restore_at_startup(&store, &engine, &checkpoint).is_none());
        assert_eq!(checkpoint.get(), None);
    }

    #[test]
    fn unparsable_lsn_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state.bin"));
        store
            .save(&Snapshot {
                records: HashMap::new(),
                lsn: "garbage".to_string(),
                timestamp: Utc::now(),
                sequence: 3,
            })
            .unwrap();

        let engine = StateEngine::new();
        let checkpoint = Checkpoint::new();
        assert!(restore_at_startup(&store, &engine, &checkpoint).is_none());
    }
}

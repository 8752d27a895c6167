//! End-to-end scenarios over the state engine and snapshot store,
//! exercising the subscriber-visible behavior of the pipeline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use riptide_core::{
    Change, ChangeOp, EventKind, Lsn, RunFilter, RunState, Snapshot, SnapshotStore, StateEngine,
    DELETED_STATUS, QUEUE_CAPACITY,
};
use uuid::Uuid;

const RUN_ID: &str = "11111111-1111-1111-1111-111111111111";
const ENV_ID: &str = "22222222-2222-2222-2222-222222222222";

fn insert(id: Uuid, env: Uuid, tags: &[Uuid], status: &str) -> Change {
    change(ChangeOp::Insert, id, env, tags, status)
}

fn update(id: Uuid, env: Uuid, tags: &[Uuid], status: &str) -> Change {
    change(ChangeOp::Update, id, env, tags, status)
}

fn change(op: ChangeOp, id: Uuid, env: Uuid, tags: &[Uuid], status: &str) -> Change {
    Change {
        op,
        row: RunState {
            id,
            env_id: env,
            tags: tags.iter().copied().collect(),
            status: status.to_string(),
            created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
            updated_at: Utc::now(),
            seq: 0,
            data: HashMap::new(),
        },
        lsn: Lsn::new(0x16B3_77A8),
    }
}

fn env_filter(env: Uuid) -> RunFilter {
    RunFilter {
        env_id: Some(env),
        ..Default::default()
    }
}

/// Cold start, one insert, then subscribe by environment.
#[test]
fn cold_start_insert_subscribe() {
    let engine = StateEngine::new();
    let run_id: Uuid = RUN_ID.parse().unwrap();
    let env_id: Uuid = ENV_ID.parse().unwrap();

    engine.apply(insert(run_id, env_id, &[], "QUEUED"));

    let mut sub = engine.attach(env_filter(env_id), None);
    let event = sub.receiver.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::Initial);
    assert_eq!(event.id, 1);
    assert_eq!(event.run.id, run_id);
    assert_eq!(event.run.status, "QUEUED");
    assert!(sub.receiver.try_recv().is_err());
}

/// A live update reaches a connected subscriber promptly.
#[tokio::test]
async fn live_delta_reaches_subscriber() {
    let engine = StateEngine::new();
    let run_id: Uuid = RUN_ID.parse().unwrap();
    let env_id: Uuid = ENV_ID.parse().unwrap();

    engine.apply(insert(run_id, env_id, &[], "QUEUED"));

    let mut sub = engine.attach(env_filter(env_id), None);
    let _initial = sub.receiver.recv().await.unwrap();

    engine.apply(update(run_id, env_id, &[], "EXECUTING"));

    let delta = tokio::time::timeout(Duration::from_millis(100), sub.receiver.recv())
        .await
        .expect("delta within 100ms")
        .unwrap();
    assert_eq!(delta.kind, EventKind::Delta);
    assert_eq!(delta.id, 2);
    assert_eq!(delta.run.status, "EXECUTING");
}

/// Tag filters narrow both the initial snapshot and live deltas.
#[test]
fn tag_filter_scopes_snapshot_and_deltas() {
    let engine = StateEngine::new();
    let env: Uuid = ENV_ID.parse().unwrap();
    let t1 = Uuid::new_v4();
    let t2 = Uuid::new_v4();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    engine.apply(insert(a, env, &[t1], "QUEUED"));
    engine.apply(insert(b, env, &[t2], "QUEUED"));

    let filter = RunFilter {
        tags: Some([t1].into_iter().collect()),
        ..Default::default()
    };
    let mut sub = engine.attach(filter, None);

    let initial = sub.receiver.try_recv().unwrap();
    assert_eq!(initial.run.id, a);
    assert!(sub.receiver.try_recv().is_err());

    engine.apply(update(b, env, &[t2], "EXECUTING"));
    assert!(sub.receiver.try_recv().is_err());

    engine.apply(update(a, env, &[t1], "EXECUTING"));
    let delta = sub.receiver.try_recv().unwrap();
    assert_eq!(delta.kind, EventKind::Delta);
    assert_eq!(delta.run.id, a);
}

/// A subscriber connecting after a delete still observes the terminal
/// transition as a tombstone snapshot.
#[test]
fn late_subscriber_sees_tombstone() {
    let engine = StateEngine::new();
    let env: Uuid = ENV_ID.parse().unwrap();
    let x = Uuid::new_v4();

    engine.apply(insert(x, env, &[], "QUEUED"));
    engine.apply(change(ChangeOp::Delete, x, env, &[], "QUEUED"));

    let mut sub = engine.attach(
        RunFilter {
            run_id: Some(x),
            ..Default::default()
        },
        None,
    );

    let event = sub.receiver.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::Initial);
    assert_eq!(event.run.status, DELETED_STATUS);
    assert!(sub.receiver.try_recv().is_err());
}

/// Snapshot, restart, resubscribe: the record reappears at its final
/// sequence with no prior events replayed.
#[test]
fn snapshot_restart_resumes_at_final_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("state.bin"));

    let engine = StateEngine::new();
    let run_id: Uuid = RUN_ID.parse().unwrap();
    let env_id: Uuid = ENV_ID.parse().unwrap();

    engine.apply(insert(run_id, env_id, &[], "QUEUED"));
    engine.apply(update(run_id, env_id, &[], "EXECUTING"));

    let (records, sequence) = engine.export();
    store
        .save(&Snapshot {
            records,
            lsn: Lsn::new(0x16B3_77A8).to_string(),
            timestamp: Utc::now(),
            sequence,
        })
        .unwrap();
    drop(engine);

    let restarted = StateEngine::new();
    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.lsn.parse::<Lsn>().unwrap(), Lsn::new(0x16B3_77A8));
    restarted.restore(snapshot);

    let mut sub = restarted.attach(env_filter(env_id), None);
    let event = sub.receiver.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::Initial);
    assert_eq!(event.id, 2);
    assert_eq!(event.run.status, "EXECUTING");
    assert!(sub.receiver.try_recv().is_err());
}

/// A paused consumer loses excess events but never stalls the pipeline or
/// other subscribers.
#[test]
fn slow_consumer_drops_without_affecting_others() {
    let engine = StateEngine::new();
    let env: Uuid = ENV_ID.parse().unwrap();
    let run_id: Uuid = RUN_ID.parse().unwrap();

    engine.apply(insert(run_id, env, &[], "QUEUED"));

    let mut paused = engine.attach(env_filter(env), None);
    let mut active = engine.attach(env_filter(env), None);
    let _ = active.receiver.try_recv().unwrap();

    let mut active_seen = Vec::new();
    for _ in 0..300 {
        engine.apply(update(run_id, env, &[], "EXECUTING"));
        while let Ok(event) = active.receiver.try_recv() {
            active_seen.push(event.id);
        }
    }

    assert_eq!(active_seen.len(), 300);
    assert!(active_seen.windows(2).all(|w| w[0] < w[1]));

    let mut paused_count = 0;
    while paused.receiver.try_recv().is_ok() {
        paused_count += 1;
    }
    assert!(paused_count <= QUEUE_CAPACITY);
}

//! The materialized state engine.
//!
//! Single owner of the record map, secondary indexes, subscriber registry,
//! recent-event rings, and the monotonic sequence counter. One
//! writer/many-reader lock serializes every public operation; the
//! replication driver is the sole source of mutations, subscriber queues
//! are fed with non-blocking sends so a slow consumer can never stall the
//! pipeline.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::event::StreamEvent;
use crate::filter::RunFilter;
use crate::run::{Change, ChangeOp, RunState, DELETED_STATUS};
use crate::snapshot::Snapshot;

/// Bounded per-subscriber queue depth. A full queue drops the event for
/// that subscriber only.
pub const QUEUE_CAPACITY: usize = 256;

/// Delta events retained per record for `Last-Event-ID` resume.
pub const RING_CAPACITY: usize = 128;

/// Handle returned by [`StateEngine::attach`]. The session owns the
/// receiving end of the queue; the engine keeps only the sender, so
/// removal is by id rather than back-pointer.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<StreamEvent>,
}

struct SubscriberHandle {
    filter: RunFilter,
    sender: mpsc::Sender<StreamEvent>,
}

#[derive(Default)]
struct EngineState {
    runs: HashMap<Uuid, RunState>,
    env_index: HashMap<Uuid, HashSet<Uuid>>,
    tag_index: HashMap<Uuid, HashSet<Uuid>>,
    sequence: u64,
    recent: HashMap<Uuid, VecDeque<StreamEvent>>,
    subscribers: HashMap<Uuid, SubscriberHandle>,
    sub_by_run: HashMap<Uuid, HashSet<Uuid>>,
    sub_by_env: HashMap<Uuid, HashSet<Uuid>>,
    sub_by_tag: HashMap<Uuid, HashSet<Uuid>>,
    wildcard_subs: HashSet<Uuid>,
}

impl EngineState {
    fn index(&mut self, run: &RunState) {
        self.env_index.entry(run.env_id).or_default().insert(run.id);
        for tag in &run.tags {
            self.tag_index.entry(*tag).or_default().insert(run.id);
        }
    }

    fn unindex(&mut self, run: &RunState) {
        if let Some(ids) = self.env_index.get_mut(&run.env_id) {
            ids.remove(&run.id);
            if ids.is_empty() {
                self.env_index.remove(&run.env_id);
            }
        }
        for tag in &run.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(&run.id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    /// Narrows candidates through the cheapest available index, then
    /// applies the full predicate. Indexes are conservative: tombstones
    /// are reachable through the run-id lookup and the full scan only.
    fn collect_matching(&self, filter: &RunFilter) -> Vec<RunState> {
        let candidates: Vec<&RunState> = if let Some(run_id) = filter.run_id {
            self.runs.get(&run_id).into_iter().collect()
        } else if let Some(env_id) = filter.env_id {
            self.env_index
                .get(&env_id)
                .map(|ids| ids.iter().filter_map(|id| self.runs.get(id)).collect())
                .unwrap_or_default()
        } else if let Some(tags) = &filter.tags {
            let mut ids: HashSet<Uuid> = HashSet::new();
            for tag in tags {
                if let Some(members) = self.tag_index.get(tag) {
                    ids.extend(members.iter().copied());
                }
            }
            ids.iter().filter_map(|id| self.runs.get(id)).collect()
        } else {
            self.runs.values().collect()
        };

        candidates
            .into_iter()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect()
    }

    /// Union of the reverse subscription indexes for a changed record,
    /// plus the wildcard set. Every candidate is rechecked with the full
    /// predicate before delivery.
    fn fanout_candidates(&self, run: &RunState) -> HashSet<Uuid> {
        let mut candidates: HashSet<Uuid> = self.wildcard_subs.iter().copied().collect();
        if let Some(subs) = self.sub_by_run.get(&run.id) {
            candidates.extend(subs.iter().copied());
        }
        if let Some(subs) = self.sub_by_env.get(&run.env_id) {
            candidates.extend(subs.iter().copied());
        }
        for tag in &run.tags {
            if let Some(subs) = self.sub_by_tag.get(tag) {
                candidates.extend(subs.iter().copied());
            }
        }
        candidates
    }

    fn register(&mut self, id: Uuid, handle: SubscriberHandle) {
        let filter = &handle.filter;
        if let Some(run_id) = filter.run_id {
            self.sub_by_run.entry(run_id).or_default().insert(id);
        }
        if let Some(env_id) = filter.env_id {
            self.sub_by_env.entry(env_id).or_default().insert(id);
        }
        if let Some(tags) = &filter.tags {
            for tag in tags {
                self.sub_by_tag.entry(*tag).or_default().insert(id);
            }
        }
        if filter.is_wildcard() {
            self.wildcard_subs.insert(id);
        }
        self.subscribers.insert(id, handle);
    }

    fn unregister(&mut self, id: Uuid) {
        let Some(handle) = self.subscribers.remove(&id) else {
            return;
        };
        let filter = handle.filter;
        if let Some(run_id) = filter.run_id {
            if let Some(subs) = self.sub_by_run.get_mut(&run_id) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.sub_by_run.remove(&run_id);
                }
            }
        }
        if let Some(env_id) = filter.env_id {
            if let Some(subs) = self.sub_by_env.get_mut(&env_id) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.sub_by_env.remove(&env_id);
                }
            }
        }
        if let Some(tags) = filter.tags {
            for tag in tags {
                if let Some(subs) = self.sub_by_tag.get_mut(&tag) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        self.sub_by_tag.remove(&tag);
                    }
                }
            }
        }
        self.wildcard_subs.remove(&id);
    }

    fn fan_out(&mut self, event: &StreamEvent) {
        let candidates = self.fanout_candidates(&event.run);
        let mut closed: Vec<Uuid> = Vec::new();

        for sub_id in candidates {
            let Some(handle) = self.subscribers.get(&sub_id) else {
                continue;
            };
            if !handle.filter.matches(&event.run) {
                continue;
            }
            match handle.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = %sub_id, seq = event.id, "subscriber queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    closed.push(sub_id);
                }
            }
        }

        for sub_id in closed {
            trace!(subscriber = %sub_id, "removing closed subscriber");
            self.unregister(sub_id);
        }
    }
}

/// The shared engine handle passed to the replication driver, the HTTP
/// layer, and the snapshot worker.
#[derive(Default)]
pub struct StateEngine {
    state: RwLock<EngineState>,
}

impl StateEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one decoded change: assigns the next sequence, reindexes,
    /// records the delta in the record's ring, and fans out to every
    /// matching subscriber without blocking.
    pub fn apply(&self, change: Change) -> u64 {
        let mut state = self.state.write();

        state.sequence += 1;
        let seq = state.sequence;

        let mut row = change.row;
        row.seq = seq;
        if change.op == ChangeOp::Delete {
            row.status = DELETED_STATUS.to_string();
        }

        if let Some(prev) = state.runs.remove(&row.id) {
            state.unindex(&prev);
        }
        if !row.is_tombstone() {
            state.index(&row);
        }

        let event = StreamEvent::delta(row.clone());
        state.runs.insert(row.id, row);

        let ring = state.recent.entry(event.run.id).or_default();
        ring.push_back(event.clone());
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }

        state.fan_out(&event);
        seq
    }

    /// Snapshot of every record matching the filter, in unspecified order.
    pub fn matching_runs(&self, filter: &RunFilter) -> Vec<RunState> {
        self.state.read().collect_matching(filter)
    }

    /// Registers a subscriber and primes its queue under one write lock,
    /// so no delta between the snapshot and registration is lost.
    ///
    /// With a resume cursor, each matching record whose ring still covers
    /// the cursor replays the deltas past it; a record whose ring has been
    /// trimmed beyond the cursor falls back to a fresh initial event, and
    /// a record unchanged since the cursor sends nothing.
    pub fn attach(&self, filter: RunFilter, last_event_id: Option<u64>) -> Subscription {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        let mut state = self.state.write();

        for run in state.collect_matching(&filter) {
            match last_event_id {
                None => {
                    push_priming(&sender, StreamEvent::initial(run));
                }
                Some(cursor) => {
                    if run.seq <= cursor {
                        continue;
                    }
                    let covered = state
                        .recent
                        .get(&run.id)
                        .and_then(VecDeque::front)
                        .is_some_and(|oldest| oldest.id <= cursor);
                    if covered {
                        if let Some(ring) = state.recent.get(&run.id) {
                            for event in ring.iter().filter(|e| e.id > cursor) {
                                push_priming(&sender, event.clone());
                            }
                        }
                    } else {
                        push_priming(&sender, StreamEvent::initial(run));
                    }
                }
            }
        }

        state.register(id, SubscriberHandle { filter, sender });
        Subscription { id, receiver }
    }

    /// Unregisters a subscriber. Idempotent; guaranteed to run on every
    /// session exit path via the session's drop guard.
    pub fn remove_subscriber(&self, id: Uuid) {
        self.state.write().unregister(id);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// Copies the record map and sequence counter for the snapshot worker.
    pub fn export(&self) -> (HashMap<Uuid, RunState>, u64) {
        let state = self.state.read();
        (state.runs.clone(), state.sequence)
    }

    /// Installs a restored snapshot, rebuilding both secondary indexes.
    pub fn restore(&self, snapshot: Snapshot) {
        let mut state = self.state.write();
        state.runs = snapshot.records;
        state.sequence = snapshot.sequence;
        state.env_index.clear();
        state.tag_index.clear();
        state.recent.clear();

        let live: Vec<RunState> = state
            .runs
            .values()
            .filter(|run| !run.is_tombstone())
            .cloned()
            .collect();
        for run in live {
            state.index(&run);
        }
    }

    /// Evicts tombstones whose terminal transition is older than the
    /// cutoff. Returns how many records were pruned.
    pub fn prune_tombstones(&self, older_than: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let stale: Vec<Uuid> = state
            .runs
            .values()
            .filter(|run| run.is_tombstone() && run.updated_at < older_than)
            .map(|run| run.id)
            .collect();
        for id in &stale {
            state.runs.remove(id);
            state.recent.remove(id);
        }
        stale.len()
    }
}

/// Initial-snapshot priming uses the same bounded-buffer policy as live
/// fan-out: a queue that fills up simply loses the excess.
fn push_priming(sender: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if let Err(TrySendError::Full(event)) = sender.try_send(event) {
        debug!(seq = event.id, "priming overflowed subscriber queue, dropping event");
    }
}

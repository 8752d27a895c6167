//! Events delivered to stream subscribers.

use serde::{Deserialize, Serialize};

use crate::run::RunState;

/// Whether an event primes a new subscriber or reports a live change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Initial,
    Delta,
}

impl EventKind {
    /// The SSE `event:` field value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Initial => "initial",
            EventKind::Delta => "delta",
        }
    }
}

/// One event on a subscriber's queue: a record snapshot plus the sequence
/// number used as the SSE event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    pub kind: EventKind,
    pub run: RunState,
}

impl StreamEvent {
    /// Snapshot event carrying the record's current sequence.
    #[must_use]
    pub fn initial(run: RunState) -> Self {
        Self {
            id: run.seq,
            kind: EventKind::Initial,
            run,
        }
    }

    /// Live change event.
    #[must_use]
    pub fn delta(run: RunState) -> Self {
        Self {
            id: run.seq,
            kind: EventKind::Delta,
            run,
        }
    }
}

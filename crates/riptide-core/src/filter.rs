//! Subscriber interest filters.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunState;

/// Structured subscriber filter. Absent fields are wildcards.
///
/// A record matches when every set field agrees: `run_id` and `env_id` by
/// equality, `created_at` as a floor, `tags` by non-empty intersection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    /// Creation-time floor: records created before this never match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashSet<Uuid>>,
}

impl RunFilter {
    /// Parses the `filter` query parameter.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        let mut filter: RunFilter = serde_json::from_str(raw)?;
        filter.normalize();
        Ok(filter)
    }

    /// An empty tag list constrains nothing; treat it as absent.
    pub fn normalize(&mut self) {
        if self.tags.as_ref().is_some_and(HashSet::is_empty) {
            self.tags = None;
        }
    }

    /// `true` when none of run/env/tags is set, so the subscriber must be
    /// considered for every change. A bare `created_at` floor still counts
    /// as wildcard for candidate selection; the full predicate applies it.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.run_id.is_none() && self.env_id.is_none() && self.tags.is_none()
    }

    /// The full match predicate.
    #[must_use]
    pub fn matches(&self, run: &RunState) -> bool {
        if let Some(run_id) = self.run_id {
            if run.id != run_id {
                return false;
            }
        }
        if let Some(env_id) = self.env_id {
            if run.env_id != env_id {
                return false;
            }
        }
        if let Some(floor) = self.created_at {
            if run.created_at < floor {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if tags.is_disjoint(&run.tags) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(env: Uuid, tags: &[Uuid], created_at: DateTime<Utc>) -> RunState {
        RunState {
            id: Uuid::new_v4(),
            env_id: env,
            tags: tags.iter().copied().collect(),
            status: "QUEUED".to_string(),
            created_at,
            updated_at: created_at,
            seq: 0,
            data: HashMap::new(),
        }
    }

    #[test]
    fn wildcard_matches_everything() {
        let filter = RunFilter::default();
        assert!(filter.is_wildcard());
        assert!(filter.matches(&run(Uuid::new_v4(), &[], Utc::now())));
    }

    #[test]
    fn env_and_created_at_conjunction() {
        let env = Uuid::new_v4();
        let floor = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let filter = RunFilter {
            env_id: Some(env),
            created_at: Some(floor),
            ..Default::default()
        };

        let newer = run(env, &[], floor + chrono::Duration::hours(1));
        let older = run(env, &[], floor - chrono::Duration::hours(1));
        let other_env = run(Uuid::new_v4(), &[], floor + chrono::Duration::hours(1));

        assert!(filter.matches(&newer));
        assert!(!filter.matches(&older));
        assert!(!filter.matches(&other_env));
    }

    #[test]
    fn tags_match_by_intersection() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let filter = RunFilter {
            tags: Some([t1].into_iter().collect()),
            ..Default::default()
        };

        assert!(filter.matches(&run(Uuid::new_v4(), &[t1, t2], Utc::now())));
        assert!(!filter.matches(&run(Uuid::new_v4(), &[t2], Utc::now())));
        assert!(!filter.matches(&run(Uuid::new_v4(), &[], Utc::now())));
    }

    #[test]
    fn empty_tag_list_normalizes_to_wildcard() {
        let filter = RunFilter::from_json(r#"{"tags": []}"#).unwrap();
        assert!(filter.is_wildcard());
        assert!(filter.matches(&run(Uuid::new_v4(), &[], Utc::now())));
    }

    #[test]
    fn from_json_parses_all_fields() {
        let raw = r#"{
            "run_id": "11111111-1111-1111-1111-111111111111",
            "env_id": "22222222-2222-2222-2222-222222222222",
            "created_at": "2024-01-01T00:00:00Z",
            "tags": ["33333333-3333-3333-3333-333333333333"]
        }"#;
        let filter = RunFilter::from_json(raw).unwrap();
        assert!(filter.run_id.is_some());
        assert!(filter.env_id.is_some());
        assert!(filter.created_at.is_some());
        assert_eq!(filter.tags.as_ref().map(HashSet::len), Some(1));
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert!(RunFilter::from_json("not json").is_err());
        assert!(RunFilter::from_json(r#"{"run_id": "not-a-uuid"}"#).is_err());
    }
}

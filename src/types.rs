//! Fragment, mining-state and search result types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for fragments
pub type FragmentId = String;

/// Integer row identity of a fragment; keys the keyword mirror
pub type StorageKey = i64;

/// Provenance tag used when the caller does not supply one
pub const DEFAULT_SOURCE: &str = "self-mined";

/// Lowest value a decay score can take
pub const MIN_DECAY_SCORE: f64 = 0.04;

/// Highest value a decay score can take
pub const MAX_DECAY_SCORE: f64 = 1.0;

/// Clamp any score into the valid decay range.
pub fn clamp_decay(score: f64) -> f64 {
    if score.is_nan() {
        return MAX_DECAY_SCORE;
    }
    score.clamp(MIN_DECAY_SCORE, MAX_DECAY_SCORE)
}

/// Generate a new time-ordered fragment id.
pub fn new_fragment_id() -> FragmentId {
    Uuid::now_v7().to_string()
}

/// A stored unit of agent memory, keyed by `(agent, path)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    /// Globally unique identifier
    pub id: FragmentId,
    /// Row identity in the fragment table
    pub storage_key: StorageKey,
    /// Persona this fragment belongs to
    pub agent: String,
    /// Caller-chosen namespace, e.g. `preferences/editor`
    pub path: String,
    /// The remembered text
    pub content: String,
    /// Provenance tag
    pub source: String,
    pub created_at: DateTime<Utc>,
    /// Moves only when `content` changes
    pub updated_at: DateTime<Utc>,
    /// Set by [`crate::FragmentStore::bump_access`] only
    pub accessed_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    /// Relevance in `[0.04, 1.0]`
    pub decay_score: f64,
    /// Pinned fragments never decay and are never collected
    pub pinned: bool,
}

impl Fragment {
    /// Most recent of content change and explicit access
    pub fn last_active(&self) -> DateTime<Utc> {
        match self.accessed_at {
            Some(accessed) if accessed > self.updated_at => accessed,
            _ => self.updated_at,
        }
    }
}

/// Input for creating a fragment
#[derive(Debug, Clone, Default)]
pub struct NewFragment {
    pub id: Option<FragmentId>,
    pub agent: String,
    pub path: String,
    pub content: String,
    pub source: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub decay_score: Option<f64>,
    pub pinned: bool,
}

impl NewFragment {
    pub fn new(
        agent: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            path: path.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<FragmentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Backdate the fragment; `updated_at` follows unless set separately
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_decay_score(mut self, score: f64) -> Self {
        self.decay_score = Some(score);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

/// Result of [`crate::FragmentStore::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// No fragment for `(agent, path)`
    NotFound,
    /// Content was identical; nothing was written
    Unchanged,
    /// Content replaced, mirror refreshed, embeddings dropped
    Updated,
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated)
    }
}

/// Filters for [`crate::FragmentStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub agent: Option<String>,
    /// Only fragments created at or after this instant
    pub created_since: Option<DateTime<Utc>>,
    /// Literal substring of `path`
    pub path_contains: Option<String>,
    pub limit: Option<usize>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn path_contains(mut self, needle: impl Into<String>) -> Self {
        self.path_contains = Some(needle.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Resume point for an external miner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MiningState {
    pub session_id: String,
    pub agent: String,
    /// Opaque, monotonically increasing cursor into the session source
    pub last_mined_offset: i64,
    /// Defaults to now on upsert; `None` on read if the stored value is unreadable
    pub mined_at: Option<DateTime<Utc>>,
}

impl MiningState {
    pub fn new(session_id: impl Into<String>, agent: impl Into<String>, offset: i64) -> Self {
        Self {
            session_id: session_id.into(),
            agent: agent.into(),
            last_mined_offset: offset,
            mined_at: None,
        }
    }

    pub fn with_mined_at(mut self, mined_at: DateTime<Utc>) -> Self {
        self.mined_at = Some(mined_at);
        self
    }
}

/// Keyword search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordHit {
    pub fragment: Fragment,
    /// Higher is more relevant
    pub score: f64,
    /// Matching region with `[`/`]` around matched terms
    pub snippet: String,
    /// Rank in results (1-based)
    pub rank: usize,
}

/// Vector search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub fragment: Fragment,
    /// Cosine similarity in `[-1, 1]`
    pub similarity: f32,
    /// Rank in results (1-based)
    pub rank: usize,
}

/// Row counts reported by [`crate::FragmentStore::stats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub fragments: i64,
    pub pinned: i64,
    pub embeddings: i64,
    pub mining_sessions: i64,
    pub gc_candidates: i64,
}

/// Differences between the fragment table and its keyword mirror
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MirrorReport {
    /// Fragments with no mirror entry
    pub missing: Vec<StorageKey>,
    /// Mirror entries with no fragment
    pub orphaned: Vec<StorageKey>,
    /// Entries whose text differs from the fragment
    pub stale: Vec<StorageKey>,
}

impl MirrorReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty() && self.stale.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation() {
        let a = new_fragment_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_fragment_id();
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn clamp_keeps_scores_in_range() {
        assert_eq!(clamp_decay(2.0), 1.0);
        assert_eq!(clamp_decay(0.0), MIN_DECAY_SCORE);
        assert_eq!(clamp_decay(f64::NAN), 1.0);
        assert_eq!(clamp_decay(0.5), 0.5);
    }

    #[test]
    fn last_active_prefers_later_access() {
        let now = Utc::now();
        let mut fragment = Fragment {
            id: new_fragment_id(),
            storage_key: 1,
            agent: "a".into(),
            path: "p".into(),
            content: "c".into(),
            source: DEFAULT_SOURCE.into(),
            created_at: now - chrono::Duration::days(10),
            updated_at: now - chrono::Duration::days(10),
            accessed_at: None,
            access_count: 0,
            decay_score: 1.0,
            pinned: false,
        };
        assert_eq!(fragment.last_active(), fragment.updated_at);

        fragment.accessed_at = Some(now);
        assert_eq!(fragment.last_active(), now);
    }
}

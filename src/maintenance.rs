//! Fragment maintenance: decay, garbage collection

use crate::error::{DbContext, Result};
use crate::mirror::WriteTxn;
use crate::store::FragmentStore;
use crate::timestamp;
use crate::types::{StorageKey, MAX_DECAY_SCORE, MIN_DECAY_SCORE};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Half-life used when none (or a non-positive one) is given
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 30.0;

/// Unpinned fragments scoring below this are collected
pub const GC_THRESHOLD: f64 = 0.05;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Relevance of a fragment last active `age_days` ago.
///
/// `0.5^(age / half_life)`, floored at 0.04 and capped at 1.0. Negative ages
/// count as zero.
pub fn decay_score(age_days: f64, half_life_days: f64) -> f64 {
    let half_life = if half_life_days > 0.0 {
        half_life_days
    } else {
        DEFAULT_HALF_LIFE_DAYS
    };
    let age = if age_days.is_nan() { 0.0 } else { age_days.max(0.0) };

    0.5_f64
        .powf(age / half_life)
        .clamp(MIN_DECAY_SCORE, MAX_DECAY_SCORE)
}

impl FragmentStore {
    /// Recompute every unpinned fragment's score from its last activity.
    ///
    /// Returns the number of rows written.
    pub async fn recalculate_decay(&self, agent: Option<&str>, half_life_days: f64) -> Result<usize> {
        let mut txn = WriteTxn::begin(self.pool(), "recalculate_decay").await?;

        let rows = sqlx::query(
            r#"
            SELECT storage_key, id, updated_at, accessed_at FROM fragments
            WHERE pinned = 0 AND (? IS NULL OR agent = ?)
            "#,
        )
        .bind(agent)
        .bind(agent)
        .fetch_all(txn.conn())
        .await
        .op("recalculate_decay")?;

        let now = Utc::now();
        let mut touched = 0;
        for row in rows {
            let key: StorageKey = row.try_get("storage_key").op("recalculate_decay")?;
            let id: String = row.try_get("id").op("recalculate_decay")?;
            let updated_raw: String = row.try_get("updated_at").op("recalculate_decay")?;
            let accessed_raw: Option<String> = row.try_get("accessed_at").op("recalculate_decay")?;

            let Some(updated_at) = timestamp::parse(&updated_raw) else {
                tracing::warn!("Skipping decay for {}: unreadable updated_at {:?}", id, updated_raw);
                continue;
            };
            let last_active = accessed_raw
                .as_deref()
                .and_then(timestamp::parse)
                .map_or(updated_at, |accessed| accessed.max(updated_at));

            let age_days = (now - last_active).num_milliseconds() as f64 / MILLIS_PER_DAY;
            let score = decay_score(age_days, half_life_days);

            sqlx::query("UPDATE fragments SET decay_score = ? WHERE storage_key = ?")
                .bind(score)
                .bind(key)
                .execute(txn.conn())
                .await
                .op("recalculate_decay")?;
            touched += 1;
        }

        txn.commit().await?;

        tracing::info!("Recalculated decay for {} fragments", touched);
        Ok(touched)
    }

    /// Number of fragments the next [`FragmentStore::gc`] would remove
    pub async fn count_gc_candidates(&self, agent: Option<&str>) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM fragments
            WHERE pinned = 0 AND decay_score < ? AND (? IS NULL OR agent = ?)
            "#,
        )
        .bind(GC_THRESHOLD)
        .bind(agent)
        .bind(agent)
        .fetch_one(self.pool())
        .await
        .op("count_gc_candidates")?;

        Ok(count as usize)
    }

    /// Permanently remove decayed, unpinned fragments with their mirror
    /// entries and embeddings
    pub async fn gc(&self, agent: Option<&str>) -> Result<usize> {
        let mut txn = WriteTxn::begin(self.pool(), "gc").await?;

        let keys: Vec<StorageKey> = sqlx::query_scalar(
            r#"
            SELECT storage_key FROM fragments
            WHERE pinned = 0 AND decay_score < ? AND (? IS NULL OR agent = ?)
            ORDER BY storage_key
            "#,
        )
        .bind(GC_THRESHOLD)
        .bind(agent)
        .bind(agent)
        .fetch_all(txn.conn())
        .await
        .op("gc")?;

        for key in &keys {
            txn.remove_fragment(*key).await?;
        }
        txn.commit().await?;

        tracing::info!("Collected {} decayed fragments", keys.len());
        Ok(keys.len())
    }
}

/// Maintenance configuration
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Restrict the pass to one agent
    pub agent: Option<String>,
    pub half_life_days: f64,
    /// Whether to recompute decay scores
    pub enable_decay: bool,
    /// Whether to collect decayed fragments
    pub enable_gc: bool,
    /// Report GC candidates instead of deleting them
    pub dry_run: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            agent: None,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            enable_decay: true,
            enable_gc: true,
            dry_run: false,
        }
    }
}

/// Maintenance report
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Fragments whose score was recomputed
    pub decayed: usize,
    /// Fragments eligible for collection after decay
    pub gc_candidates: usize,
    /// Fragments actually removed (always 0 on a dry run)
    pub collected: usize,
    pub dry_run: bool,
}

/// Run maintenance tasks: decay first, then GC.
///
/// A dry run still recomputes scores; it only skips deletion.
pub async fn run_maintenance(
    store: &FragmentStore,
    config: &MaintenanceConfig,
) -> Result<MaintenanceReport> {
    let agent = config.agent.as_deref();
    let mut report = MaintenanceReport {
        dry_run: config.dry_run,
        ..MaintenanceReport::default()
    };

    if config.enable_decay {
        report.decayed = store.recalculate_decay(agent, config.half_life_days).await?;
    }

    if config.enable_gc {
        report.gc_candidates = store.count_gc_candidates(agent).await?;
        if !config.dry_run {
            report.collected = store.gc(agent).await?;
        }
    }

    tracing::info!(
        "Maintenance finished: {} decayed, {} candidates, {} collected",
        report.decayed,
        report.gc_candidates,
        report.collected
    );
    Ok(report)
}

/// Builder for maintenance config
pub struct MaintenanceConfigBuilder {
    config: MaintenanceConfig,
}

impl MaintenanceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MaintenanceConfig::default(),
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.config.agent = Some(agent.into());
        self
    }

    pub fn half_life_days(mut self, days: f64) -> Self {
        self.config.half_life_days = days;
        self
    }

    pub fn enable_decay(mut self, enable: bool) -> Self {
        self.config.enable_decay = enable;
        self
    }

    pub fn enable_gc(mut self, enable: bool) -> Self {
        self.config.enable_gc = enable;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    pub fn build(self) -> MaintenanceConfig {
        self.config
    }
}

impl Default for MaintenanceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewFragment;
    use chrono::Duration;

    #[test]
    fn decay_curve() {
        assert_eq!(decay_score(0.0, 30.0), 1.0);
        assert!((decay_score(30.0, 30.0) - 0.5).abs() < 1e-12);
        assert!((decay_score(60.0, 30.0) - 0.25).abs() < 1e-12);
        assert_eq!(decay_score(400.0, 30.0), MIN_DECAY_SCORE);
        assert_eq!(decay_score(-5.0, 30.0), 1.0);
    }

    #[test]
    fn non_positive_half_life_uses_default() {
        assert_eq!(decay_score(30.0, 0.0), decay_score(30.0, DEFAULT_HALF_LIFE_DAYS));
        assert_eq!(decay_score(30.0, -7.0), decay_score(30.0, DEFAULT_HALF_LIFE_DAYS));
        assert_eq!(decay_score(30.0, f64::NAN), decay_score(30.0, DEFAULT_HALF_LIFE_DAYS));
    }

    #[test]
    fn decay_is_monotonic() {
        let mut previous = 1.0;
        for day in 0..200 {
            let score = decay_score(day as f64, 14.0);
            assert!(score <= previous);
            assert!((MIN_DECAY_SCORE..=MAX_DECAY_SCORE).contains(&score));
            previous = score;
        }
    }

    async fn aged(store: &FragmentStore, path: &str, days: i64) -> crate::types::Fragment {
        store
            .create(
                NewFragment::new("agent", path, format!("content {path}"))
                    .with_created_at(Utc::now() - Duration::days(days)),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn recalculation_follows_age() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        aged(&store, "fresh", 0).await;
        aged(&store, "month", 30).await;
        aged(&store, "ancient", 400).await;

        assert_eq!(store.recalculate_decay(None, 30.0).await.unwrap(), 3);

        let fresh = store.get("agent", "fresh").await.unwrap().unwrap();
        let month = store.get("agent", "month").await.unwrap().unwrap();
        let ancient = store.get("agent", "ancient").await.unwrap().unwrap();
        assert!(fresh.decay_score > 0.99);
        assert!((month.decay_score - 0.5).abs() < 0.01);
        assert_eq!(ancient.decay_score, MIN_DECAY_SCORE);

        assert_eq!(store.count_gc_candidates(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_access_counts_as_activity() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        let old = aged(&store, "old", 120).await;
        store.bump_access(&old.id).await.unwrap();

        store.recalculate_decay(None, 30.0).await.unwrap();
        let refreshed = store.get_by_id(&old.id).await.unwrap().unwrap();
        assert!(refreshed.decay_score > 0.99);
    }

    #[tokio::test]
    async fn pinned_fragments_are_immune() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        store
            .create(
                NewFragment::new("agent", "keep", "pinned forever")
                    .with_created_at(Utc::now() - Duration::days(400))
                    .with_decay_score(0.04)
                    .pinned(),
            )
            .await
            .unwrap();
        aged(&store, "drop", 400).await;

        assert_eq!(store.recalculate_decay(None, 30.0).await.unwrap(), 1);
        let kept = store.get("agent", "keep").await.unwrap().unwrap();
        assert_eq!(kept.decay_score, 0.04);

        assert_eq!(store.gc(None).await.unwrap(), 1);
        assert!(store.get("agent", "keep").await.unwrap().is_some());
        assert!(store.get("agent", "drop").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gc_removes_mirror_and_embeddings_and_is_idempotent() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        let doomed = store
            .create(NewFragment::new("agent", "doomed", "forgotten detail").with_decay_score(0.04))
            .await
            .unwrap();
        store.create(NewFragment::new("agent", "alive", "kept detail")).await.unwrap();
        store
            .upsert_embedding(&doomed.id, "p", "m", 1, &[1.0])
            .await
            .unwrap();

        let candidates = store.count_gc_candidates(None).await.unwrap();
        assert_eq!(store.gc(None).await.unwrap(), candidates);
        assert_eq!(store.gc(None).await.unwrap(), 0);
        assert_eq!(store.count_gc_candidates(None).await.unwrap(), 0);

        assert!(store.keyword_search("forgotten", 10, None).await.unwrap().is_empty());
        assert_eq!(store.keyword_search("kept", 10, None).await.unwrap().len(), 1);
        assert_eq!(store.count_embeddings("p", "m").await.unwrap(), 0);
        assert!(store.check_mirror().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn bump_rescues_a_candidate() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        let fragment = store
            .create(NewFragment::new("agent", "p", "c").with_decay_score(0.04))
            .await
            .unwrap();
        assert_eq!(store.count_gc_candidates(None).await.unwrap(), 1);

        store.bump_access(&fragment.id).await.unwrap();
        assert_eq!(store.count_gc_candidates(None).await.unwrap(), 0);
        assert_eq!(store.gc(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn agent_scope_limits_decay_and_gc() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        for agent in ["ada", "bob"] {
            store
                .create(
                    NewFragment::new(agent, "old", "very old")
                        .with_created_at(Utc::now() - Duration::days(400)),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.recalculate_decay(Some("ada"), 30.0).await.unwrap(), 1);
        let bob = store.get("bob", "old").await.unwrap().unwrap();
        assert_eq!(bob.decay_score, 1.0);

        assert_eq!(store.count_gc_candidates(Some("bob")).await.unwrap(), 0);
        assert_eq!(store.gc(Some("ada")).await.unwrap(), 1);
        assert!(store.get("bob", "old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_timestamps_are_skipped() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        aged(&store, "good", 30).await;
        let bad = aged(&store, "bad", 30).await;
        sqlx::query("UPDATE fragments SET updated_at = 'not a time' WHERE id = ?")
            .bind(&bad.id)
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(store.recalculate_decay(None, 30.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn maintenance_dry_run_keeps_fragments() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        aged(&store, "ancient", 400).await;
        aged(&store, "fresh", 0).await;

        let config = MaintenanceConfigBuilder::new().dry_run(true).build();
        let report = run_maintenance(&store, &config).await.unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                decayed: 2,
                gc_candidates: 1,
                collected: 0,
                dry_run: true,
            }
        );
        assert!(store.get("agent", "ancient").await.unwrap().is_some());

        let report = run_maintenance(&store, &MaintenanceConfig::default())
            .await
            .unwrap();
        assert_eq!(report.collected, 1);
        assert!(store.get("agent", "ancient").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn maintenance_steps_can_be_disabled() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        aged(&store, "ancient", 400).await;

        let config = MaintenanceConfigBuilder::new()
            .agent("agent")
            .half_life_days(7.0)
            .enable_gc(false)
            .build();
        let report = run_maintenance(&store, &config).await.unwrap();
        assert_eq!(report.decayed, 1);
        assert_eq!(report.collected, 0);

        let config = MaintenanceConfigBuilder::new().enable_decay(false).build();
        let report = run_maintenance(&store, &config).await.unwrap();
        assert_eq!(report.decayed, 0);
        assert_eq!(report.collected, 1);
    }
}

//! Fragment storage using SQLite

use crate::config::StoreConfig;
use crate::error::{require, DbContext, MemoryError, Result};
use crate::mirror::WriteTxn;
use crate::paths::{resolve_db_path, DbLocation};
use crate::timestamp;
use crate::types::{
    clamp_decay, new_fragment_id, Fragment, ListOptions, MirrorReport, NewFragment, StorageKey,
    StoreStats, UpdateOutcome, DEFAULT_SOURCE, MAX_DECAY_SCORE,
};

use chrono::{SubsecRound, Utc};
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;

/// Amount a single access adds to the decay score
pub const ACCESS_BOOST: f64 = 0.1;

/// Column list for every fragment read; queries alias the table as `f`.
pub(crate) const FRAGMENT_COLUMNS: &str = "f.storage_key, f.id, f.agent, f.path, f.content, \
     f.source, f.created_at, f.updated_at, f.accessed_at, f.access_count, f.decay_score, f.pinned";

/// Fragment store: CRUD with the keyword mirror kept in lockstep
#[derive(Clone)]
pub struct FragmentStore {
    pool: SqlitePool,
    location: DbLocation,
}

impl std::fmt::Debug for FragmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentStore")
            .field("location", &self.location)
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl FragmentStore {
    /// Open (creating if needed) the store described by `config`
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let location = resolve_db_path(config.db_path.as_deref())?;
        let pool = crate::schema::connect(&location, config).await?;
        let store = Self { pool, location };
        crate::schema::bootstrap(&store).await?;

        tracing::debug!("Opened fragment store at {}", store.location);
        Ok(store)
    }

    /// Create a private in-memory store (tests, scratch use)
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory()).await
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Where this store lives
    pub fn location(&self) -> &DbLocation {
        &self.location
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Save a new fragment and its mirror entry
    pub async fn create(&self, input: NewFragment) -> Result<Fragment> {
        require("agent", &input.agent)?;
        require("path", &input.path)?;
        require("content", &input.content)?;

        // Storage keeps microseconds
        let created_at = input.created_at.unwrap_or_else(Utc::now).trunc_subsecs(6);
        let updated_at = input
            .updated_at
            .map(|ts| ts.trunc_subsecs(6))
            .unwrap_or(created_at)
            .max(created_at);

        let mut fragment = Fragment {
            id: input
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_fragment_id),
            storage_key: 0,
            agent: input.agent,
            path: input.path,
            content: input.content,
            source: input
                .source
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            created_at,
            updated_at,
            accessed_at: None,
            access_count: 0,
            decay_score: input.decay_score.map(clamp_decay).unwrap_or(MAX_DECAY_SCORE),
            pinned: input.pinned,
        };

        let mut txn = WriteTxn::begin(&self.pool, "create").await?;
        fragment.storage_key = txn.insert_fragment(&fragment).await?;
        txn.commit().await?;

        tracing::debug!("Created fragment {} at {}/{}", fragment.id, fragment.agent, fragment.path);
        Ok(fragment)
    }

    /// Replace a fragment's content.
    ///
    /// Identical content is a no-op: timestamps, mirror and embeddings stay
    /// untouched.
    pub async fn update(&self, agent: &str, path: &str, new_content: &str) -> Result<UpdateOutcome> {
        require("content", new_content)?;

        let mut txn = WriteTxn::begin(&self.pool, "update").await?;

        let current = sqlx::query(
            "SELECT storage_key, id, content, created_at FROM fragments WHERE agent = ? AND path = ?",
        )
        .bind(agent)
        .bind(path)
        .fetch_optional(txn.conn())
        .await
        .op("update")?;

        let Some(row) = current else {
            return Ok(UpdateOutcome::NotFound);
        };

        let key: StorageKey = row.try_get("storage_key").op("update")?;
        let id: String = row.try_get("id").op("update")?;
        let content: String = row.try_get("content").op("update")?;

        if content == new_content {
            return Ok(UpdateOutcome::Unchanged);
        }

        let created_raw: String = row.try_get("created_at").op("update")?;
        let created_at = parse_ts("created_at", &created_raw)?;
        // Never earlier than creation, even for future-dated fragments
        let updated_at = Utc::now().trunc_subsecs(6).max(created_at);

        txn.replace_content(key, &id, new_content, &timestamp::format(updated_at))
            .await?;
        txn.commit().await?;

        tracing::debug!("Updated fragment {} at {}/{}", id, agent, path);
        Ok(UpdateOutcome::Updated)
    }

    /// Delete a fragment permanently; returns `false` when nothing matched
    pub async fn delete(&self, agent: &str, path: &str) -> Result<bool> {
        let mut txn = WriteTxn::begin(&self.pool, "delete").await?;

        let key: Option<StorageKey> =
            sqlx::query_scalar("SELECT storage_key FROM fragments WHERE agent = ? AND path = ?")
                .bind(agent)
                .bind(path)
                .fetch_optional(txn.conn())
                .await
                .op("delete")?;

        let Some(key) = key else {
            return Ok(false);
        };

        txn.remove_fragment(key).await?;
        txn.commit().await?;

        tracing::debug!("Deleted fragment {}/{}", agent, path);
        Ok(true)
    }

    /// Load a fragment by its logical key
    pub async fn get(&self, agent: &str, path: &str) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE f.agent = ? AND f.path = ?");
        let row = sqlx::query(&sql)
            .bind(agent)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .op("get")?;

        row.as_ref().map(row_to_fragment).transpose()
    }

    /// Load a fragment by its row identity
    pub async fn get_by_storage_key(&self, key: StorageKey) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE f.storage_key = ?");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .op("get_by_storage_key")?;

        row.as_ref().map(row_to_fragment).transpose()
    }

    /// Load a fragment by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE f.id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .op("get_by_id")?;

        row.as_ref().map(row_to_fragment).transpose()
    }

    /// Every agent's fragment at `path`, newest first
    pub async fn find_by_path(&self, path: &str) -> Result<Vec<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE f.path = ?");
        let rows = sqlx::query(&sql)
            .bind(path)
            .fetch_all(&self.pool)
            .await
            .op("find_by_path")?;

        let mut fragments = rows.iter().map(row_to_fragment).collect::<Result<Vec<_>>>()?;
        fragments.sort_by(newest_first);
        Ok(fragments)
    }

    /// List fragments, newest creation first.
    ///
    /// Ordered by `created_at` rather than `updated_at`: the latter only
    /// moves on real content changes. The time filter and ordering run on
    /// decoded timestamps, so rows in legacy formats place correctly.
    pub async fn list(&self, options: &ListOptions) -> Result<Vec<Fragment>> {
        let mut sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments f WHERE 1 = 1");
        if options.agent.is_some() {
            sql.push_str(" AND f.agent = ?");
        }
        if options.path_contains.is_some() {
            sql.push_str(" AND f.path LIKE ? ESCAPE '\\'");
        }

        let mut query = sqlx::query(&sql);
        if let Some(agent) = &options.agent {
            query = query.bind(agent);
        }
        if let Some(needle) = &options.path_contains {
            query = query.bind(format!("%{}%", escape_like(needle)));
        }

        let rows = query.fetch_all(&self.pool).await.op("list")?;
        let mut fragments = Vec::with_capacity(rows.len());
        for row in &rows {
            let fragment = row_to_fragment(row)?;
            if options.created_since.map_or(true, |since| fragment.created_at >= since) {
                fragments.push(fragment);
            }
        }

        fragments.sort_by(newest_first);
        if let Some(limit) = options.limit {
            fragments.truncate(limit);
        }
        Ok(fragments)
    }

    /// Record an explicit use of a fragment.
    ///
    /// The only operation that raises a decay score.
    pub async fn bump_access(&self, id: &str) -> Result<Fragment> {
        require("id", id)?;

        let result = sqlx::query(
            r#"
            UPDATE fragments
            SET accessed_at = ?, access_count = access_count + 1,
                decay_score = ROUND(MIN(decay_score + ?, ?), 6)
            WHERE id = ?
            "#,
        )
        .bind(timestamp::now())
        .bind(ACCESS_BOOST)
        .bind(MAX_DECAY_SCORE)
        .bind(id)
        .execute(&self.pool)
        .await
        .op("bump_access")?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::NotFound(format!("fragment {id}")));
        }

        self.get_by_id(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("fragment {id}")))
    }

    /// Pin or unpin a fragment; returns `false` when nothing matched
    pub async fn set_pinned(&self, agent: &str, path: &str, pinned: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE fragments SET pinned = ? WHERE agent = ? AND path = ?")
            .bind(pinned)
            .bind(agent)
            .bind(path)
            .execute(&self.pool)
            .await
            .op("set_pinned")?;

        Ok(result.rows_affected() > 0)
    }

    /// Row counts, optionally scoped to one agent
    pub async fn stats(&self, agent: Option<&str>) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(*) FROM fragments WHERE ?1 IS NULL OR agent = ?1) AS fragments,
                (SELECT count(*) FROM fragments WHERE pinned = 1 AND (?1 IS NULL OR agent = ?1)) AS pinned,
                (SELECT count(*) FROM embeddings e JOIN fragments f ON f.id = e.fragment_id
                    WHERE ?1 IS NULL OR f.agent = ?1) AS embeddings,
                (SELECT count(*) FROM mining_state WHERE ?1 IS NULL OR agent = ?1) AS mining_sessions
            "#,
        )
        .bind(agent)
        .fetch_one(&self.pool)
        .await
        .op("stats")?;

        Ok(StoreStats {
            fragments: row.try_get("fragments").op("stats")?,
            pinned: row.try_get("pinned").op("stats")?,
            embeddings: row.try_get("embeddings").op("stats")?,
            mining_sessions: row.try_get("mining_sessions").op("stats")?,
            gc_candidates: self.count_gc_candidates(agent).await? as i64,
        })
    }

    /// Compare the fragment table with its keyword mirror without changing either
    pub async fn check_mirror(&self) -> Result<MirrorReport> {
        let missing: Vec<StorageKey> = sqlx::query_scalar(
            r#"
            SELECT f.storage_key FROM fragments f
            WHERE NOT EXISTS (SELECT 1 FROM fragments_fts m WHERE m.rowid = f.storage_key)
            ORDER BY f.storage_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .op("check_mirror")?;

        let orphaned: Vec<StorageKey> = sqlx::query_scalar(
            r#"
            SELECT m.rowid FROM fragments_fts m
            WHERE NOT EXISTS (SELECT 1 FROM fragments f WHERE f.storage_key = m.rowid)
            ORDER BY m.rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .op("check_mirror")?;

        let stale: Vec<StorageKey> = sqlx::query_scalar(
            r#"
            SELECT f.storage_key FROM fragments f
            JOIN fragments_fts m ON m.rowid = f.storage_key
            WHERE m.content IS NOT f.content
            ORDER BY f.storage_key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .op("check_mirror")?;

        Ok(MirrorReport {
            missing,
            orphaned,
            stale,
        })
    }

    /// Rebuild the keyword mirror from the fragment table in one transaction
    pub async fn rebuild_mirror(&self) -> Result<u64> {
        let mut txn = WriteTxn::begin(&self.pool, "rebuild_mirror").await?;
        let indexed = txn.rebuild().await?;
        txn.commit().await?;
        Ok(indexed)
    }
}

/// Newest creation first, ties broken by the later storage key.
pub(crate) fn newest_first(a: &Fragment, b: &Fragment) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.storage_key.cmp(&a.storage_key))
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn parse_ts(column: &str, raw: &str) -> Result<chrono::DateTime<Utc>> {
    timestamp::parse(raw)
        .ok_or_else(|| MemoryError::Decode(format!("unreadable {column} timestamp {raw:?}")))
}

/// Helper: Convert database row to Fragment
pub(crate) fn row_to_fragment(row: &sqlx::sqlite::SqliteRow) -> Result<Fragment> {
    let created_at: String = row.try_get("created_at").op("decode fragment")?;
    let updated_at: String = row.try_get("updated_at").op("decode fragment")?;
    let accessed_at: Option<String> = row.try_get("accessed_at").op("decode fragment")?;

    Ok(Fragment {
        id: row.try_get("id").op("decode fragment")?,
        storage_key: row.try_get("storage_key").op("decode fragment")?,
        agent: row.try_get("agent").op("decode fragment")?,
        path: row.try_get("path").op("decode fragment")?,
        content: row.try_get("content").op("decode fragment")?,
        source: row.try_get("source").op("decode fragment")?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        accessed_at: accessed_at.as_deref().and_then(timestamp::parse),
        access_count: row.try_get("access_count").op("decode fragment")?,
        decay_score: row.try_get("decay_score").op("decode fragment")?,
        pinned: row.try_get("pinned").op("decode fragment")?,
    })
}

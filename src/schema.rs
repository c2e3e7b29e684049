//! Connection setup, schema bootstrap and the metadata table

use crate::config::StoreConfig;
use crate::error::{DbContext, Result};
use crate::paths::DbLocation;
use crate::store::FragmentStore;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Metadata key recording when the keyword mirror was last rebuilt
pub const FTS_REBUILT_KEY: &str = "fts_rebuilt_at";

/// Open a pool for the resolved location.
///
/// In-memory databases live and die with their connection, so the pool is
/// pinned to a single connection that is never reaped.
pub(crate) async fn connect(location: &DbLocation, config: &StoreConfig) -> Result<SqlitePool> {
    let (options, pool_options) = match location {
        DbLocation::InMemory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:").op("connect")?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
            (options, pool_options)
        }
        DbLocation::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            let pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
            (options, pool_options)
        }
    };

    let options = options
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);

    pool_options.connect_with(options).await.op("connect")
}

/// Create tables if needed, then rebuild the keyword mirror once per database.
pub(crate) async fn bootstrap(store: &FragmentStore) -> Result<()> {
    sqlx::migrate!("./migrations").run(store.pool()).await?;

    if store.get_meta(FTS_REBUILT_KEY).await?.is_none() {
        let indexed = store.rebuild_mirror().await?;
        tracing::info!("Built keyword mirror for {} fragments", indexed);
    }

    Ok(())
}

impl FragmentStore {
    /// Read a metadata flag
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .op("get_meta")
    }

    /// Write a metadata flag, replacing any previous value
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        crate::error::require("key", key)?;
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .op("set_meta")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::mirror::WriteTxn;
    use crate::{timestamp, FragmentStore, ListOptions, NewFragment, StoreConfig, StoreConfigBuilder};
    use std::time::Duration;

    fn shared_file_config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfigBuilder::new()
            .db_path(dir.path().join("shared.db").to_string_lossy())
            .busy_timeout(Duration::from_secs(5))
            .build()
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        assert_eq!(store.get_meta("missing").await.unwrap(), None);

        store.set_meta("flag", "one").await.unwrap();
        store.set_meta("flag", "two").await.unwrap();
        assert_eq!(store.get_meta("flag").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn bootstrap_marks_mirror_built() {
        let store = FragmentStore::open_in_memory().await.unwrap();
        assert!(store.get_meta(super::FTS_REBUILT_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reopening_file_store_keeps_data_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/memory.db");
        let config = StoreConfigBuilder::new()
            .db_path(db.to_string_lossy())
            .build();

        {
            let store = FragmentStore::open(&config).await.unwrap();
            store
                .create(NewFragment::new("agent", "facts/city", "lives in Reykjavik"))
                .await
                .unwrap();
            store.close().await;
        }

        let store = FragmentStore::open(&config).await.unwrap();
        assert!(store.get("agent", "facts/city").await.unwrap().is_some());
        let hits = store.keyword_search("Reykjavik", 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store.check_mirror().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn second_writer_waits_for_open_write_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let config = shared_file_config(&dir);
        let first = FragmentStore::open(&config).await.unwrap();
        let second = FragmentStore::open(&config).await.unwrap();

        let created = first
            .create(NewFragment::new("agent", "p", "before"))
            .await
            .unwrap();

        // Read inside the transaction, then let the other store try to commit
        let mut txn = WriteTxn::begin(first.pool(), "test").await.unwrap();
        let content: String = sqlx::query_scalar("SELECT content FROM fragments WHERE id = ?")
            .bind(&created.id)
            .fetch_one(txn.conn())
            .await
            .unwrap();
        assert_eq!(content, "before");

        let writer = {
            let second = second.clone();
            tokio::spawn(async move { second.create(NewFragment::new("agent", "q", "from second")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());

        txn.replace_content(created.storage_key, &created.id, "after", &timestamp::now())
            .await
            .unwrap();
        txn.commit().await.unwrap();

        writer.await.unwrap().unwrap();
        assert_eq!(first.get("agent", "p").await.unwrap().unwrap().content, "after");
        assert_eq!(first.list(&ListOptions::new()).await.unwrap().len(), 2);
        assert!(second.check_mirror().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn concurrent_stores_interleave_read_then_write_operations() {
        let dir = tempfile::tempdir().unwrap();
        let config = shared_file_config(&dir);
        let first = FragmentStore::open(&config).await.unwrap();
        let second = FragmentStore::open(&config).await.unwrap();

        for i in 0..10 {
            first
                .create(NewFragment::new("agent", format!("n/{i}"), format!("version zero {i}")))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for (name, store) in [("first", first.clone()), ("second", second.clone())] {
            tasks.push(tokio::spawn(async move {
                for round in 0..5 {
                    for i in 0..10 {
                        let text = format!("{name} round {round} item {i}");
                        store.update("agent", &format!("n/{i}"), &text).await?;
                    }
                }
                store.delete("agent", &format!("n/{}", if name == "first" { 0 } else { 9 })).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        assert_eq!(second.list(&ListOptions::new()).await.unwrap().len(), 8);
        assert!(first.check_mirror().await.unwrap().is_consistent());
    }
}

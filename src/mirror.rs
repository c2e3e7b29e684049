//! Paired writes to the fragment table and its keyword mirror
//!
//! The mirror is an FTS5 table whose `rowid` is the fragment's storage key.
//! Every write that touches fragment content goes through [`WriteTxn`], which
//! only offers operations that change both sides together. Dropping a
//! `WriteTxn` without calling [`WriteTxn::commit`] rolls everything back.

use crate::error::{DbContext, MemoryError, Result};
use crate::schema::FTS_REBUILT_KEY;
use crate::timestamp;
use crate::types::{Fragment, StorageKey};

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

/// A unit of work spanning the fragment table, the mirror and embeddings
pub(crate) struct WriteTxn {
    tx: Transaction<'static, Sqlite>,
    op: &'static str,
}

/// Writers take the database write lock up front so the busy timeout applies.
pub(crate) const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

impl WriteTxn {
    pub(crate) async fn begin(pool: &SqlitePool, op: &'static str) -> Result<Self> {
        let tx = pool.begin_with(BEGIN_WRITE).await.op(op)?;
        Ok(Self { tx, op })
    }

    /// Connection for writes that never touch content (scores, pins).
    pub(crate) fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Insert a fragment row and its mirror entry; returns the storage key.
    pub(crate) async fn insert_fragment(&mut self, fragment: &Fragment) -> Result<StorageKey> {
        let op = self.op;
        let result = sqlx::query(
            r#"
            INSERT INTO fragments (
                id, agent, path, content, source, created_at, updated_at,
                accessed_at, access_count, decay_score, pinned
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&fragment.id)
        .bind(&fragment.agent)
        .bind(&fragment.path)
        .bind(&fragment.content)
        .bind(&fragment.source)
        .bind(timestamp::format(fragment.created_at))
        .bind(timestamp::format(fragment.updated_at))
        .bind(fragment.accessed_at.map(timestamp::format))
        .bind(fragment.access_count)
        .bind(fragment.decay_score)
        .bind(fragment.pinned)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => MemoryError::Validation(
                format!("fragment {}/{} already exists", fragment.agent, fragment.path),
            ),
            source => MemoryError::Database { op, source },
        })?;

        let key = result.last_insert_rowid();
        self.index(key, &fragment.content).await?;
        Ok(key)
    }

    /// Replace content, drop every cached embedding, refresh the mirror entry.
    pub(crate) async fn replace_content(
        &mut self,
        key: StorageKey,
        id: &str,
        content: &str,
        updated_at: &str,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE fragments SET content = ?, updated_at = ? WHERE storage_key = ?")
            .bind(content)
            .bind(updated_at)
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;
        if result.rows_affected() != 1 {
            return Err(MemoryError::Consistency(format!(
                "{}: fragment row {key} vanished mid-transaction",
                self.op
            )));
        }

        let dropped = sqlx::query("DELETE FROM embeddings WHERE fragment_id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .op(self.op)?
            .rows_affected();
        if dropped > 0 {
            tracing::debug!("Invalidated {} embeddings for fragment {}", dropped, id);
        }

        self.unindex(key).await?;
        self.index(key, content).await
    }

    /// Delete a fragment row and its mirror entry. Embeddings cascade.
    pub(crate) async fn remove_fragment(&mut self, key: StorageKey) -> Result<()> {
        self.unindex(key).await?;

        let result = sqlx::query("DELETE FROM fragments WHERE storage_key = ?")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;
        if result.rows_affected() != 1 {
            return Err(MemoryError::Consistency(format!(
                "{}: fragment row {key} vanished mid-transaction",
                self.op
            )));
        }
        Ok(())
    }

    /// Drop and repopulate the whole mirror from the fragment table.
    pub(crate) async fn rebuild(&mut self) -> Result<u64> {
        sqlx::query("DELETE FROM fragments_fts")
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;

        sqlx::query("INSERT INTO fragments_fts (rowid, content) SELECT storage_key, content FROM fragments")
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;

        let indexed: i64 = sqlx::query_scalar("SELECT count(*) FROM fragments_fts")
            .fetch_one(&mut *self.tx)
            .await
            .op(self.op)?;

        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(FTS_REBUILT_KEY)
        .bind(timestamp::now())
        .execute(&mut *self.tx)
        .await
        .op(self.op)?;

        Ok(indexed as u64)
    }

    pub(crate) async fn commit(self) -> Result<()> {
        self.tx.commit().await.op(self.op)
    }

    async fn index(&mut self, key: StorageKey, content: &str) -> Result<()> {
        sqlx::query("INSERT INTO fragments_fts (rowid, content) VALUES (?, ?)")
            .bind(key)
            .bind(content)
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;
        Ok(())
    }

    async fn unindex(&mut self, key: StorageKey) -> Result<()> {
        let entries: i64 = sqlx::query_scalar("SELECT count(*) FROM fragments_fts WHERE rowid = ?")
            .bind(key)
            .fetch_one(&mut *self.tx)
            .await
            .op(self.op)?;
        if entries != 1 {
            return Err(MemoryError::Consistency(format!(
                "{}: expected one mirror entry for fragment row {key}, found {entries}",
                self.op
            )));
        }

        sqlx::query("DELETE FROM fragments_fts WHERE rowid = ?")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .op(self.op)?;
        Ok(())
    }
}

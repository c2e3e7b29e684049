//! Cached embedding vectors per (fragment, provider, model)

use crate::error::{require, DbContext, MemoryError, Result};
use crate::mirror::BEGIN_WRITE;
use crate::store::{newest_first, row_to_fragment, FragmentStore, FRAGMENT_COLUMNS};
use crate::timestamp;
use crate::types::Fragment;

use sqlx::Row;
use std::collections::{HashMap, HashSet};

/// Upper bound on ids bound into a single lookup query
pub const LOOKUP_BATCH: usize = 500;

/// Encode a vector as a storage blob.
pub(crate) fn encode_vector(vector: &[f32]) -> Result<Vec<u8>> {
    bincode::serialize(vector).map_err(|e| MemoryError::Decode(format!("encode vector: {e}")))
}

/// Decode a storage blob, checking it against the declared dimension count.
pub(crate) fn decode_vector(blob: &[u8], dims: i64) -> Result<Vec<f32>> {
    let vector: Vec<f32> =
        bincode::deserialize(blob).map_err(|e| MemoryError::Decode(format!("vector blob: {e}")))?;
    if vector.len() as i64 != dims {
        return Err(MemoryError::Decode(format!(
            "vector blob has {} values, expected {dims}",
            vector.len()
        )));
    }
    Ok(vector)
}

impl FragmentStore {
    /// Store (or replace) the vector for one fragment under one provider/model
    pub async fn upsert_embedding(
        &self,
        fragment_id: &str,
        provider: &str,
        model: &str,
        dims: usize,
        vector: &[f32],
    ) -> Result<()> {
        self.write_embedding(fragment_id, None, provider, model, dims, vector)
            .await
            .map(|_| ())
    }

    /// Store a vector only if the fragment still holds `content`.
    ///
    /// Returns `false`, writing nothing, when the fragment was changed or
    /// deleted after the vector was computed.
    pub async fn upsert_embedding_if_unchanged(
        &self,
        fragment_id: &str,
        content: &str,
        provider: &str,
        model: &str,
        dims: usize,
        vector: &[f32],
    ) -> Result<bool> {
        self.write_embedding(fragment_id, Some(content), provider, model, dims, vector)
            .await
    }

    async fn write_embedding(
        &self,
        fragment_id: &str,
        expected_content: Option<&str>,
        provider: &str,
        model: &str,
        dims: usize,
        vector: &[f32],
    ) -> Result<bool> {
        require("fragment_id", fragment_id)?;
        require("provider", provider)?;
        require("model", model)?;
        if vector.is_empty() {
            return Err(MemoryError::Validation("vector is empty".to_string()));
        }
        if vector.len() != dims {
            return Err(MemoryError::Validation(format!(
                "vector has {} values but dims is {dims}",
                vector.len()
            )));
        }

        let blob = encode_vector(vector)?;

        let mut tx = self.pool().begin_with(BEGIN_WRITE).await.op("upsert_embedding")?;

        let current: Option<String> = sqlx::query_scalar("SELECT content FROM fragments WHERE id = ?")
            .bind(fragment_id)
            .fetch_optional(&mut *tx)
            .await
            .op("upsert_embedding")?;
        match (current, expected_content) {
            (None, None) => return Err(MemoryError::NotFound(format!("fragment {fragment_id}"))),
            (None, Some(_)) => return Ok(false),
            (Some(current), Some(expected)) if current != expected => return Ok(false),
            _ => {}
        }

        sqlx::query(
            r#"
            INSERT INTO embeddings (fragment_id, provider, model, dims, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(fragment_id, provider, model) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(fragment_id)
        .bind(provider)
        .bind(model)
        .bind(dims as i64)
        .bind(blob)
        .bind(timestamp::now())
        .execute(&mut *tx)
        .await
        .op("upsert_embedding")?;

        tx.commit().await.op("upsert_embedding")?;

        tracing::debug!("Stored {}-dim {}/{} embedding for {}", dims, provider, model, fragment_id);
        Ok(true)
    }

    /// Load one cached vector
    pub async fn get_embedding(
        &self,
        fragment_id: &str,
        provider: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>> {
        let row = sqlx::query(
            "SELECT dims, vector FROM embeddings WHERE fragment_id = ? AND provider = ? AND model = ?",
        )
        .bind(fragment_id)
        .bind(provider)
        .bind(model)
        .fetch_optional(self.pool())
        .await
        .op("get_embedding")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let dims: i64 = row.try_get("dims").op("get_embedding")?;
        let blob: Vec<u8> = row.try_get("vector").op("get_embedding")?;
        decode_vector(&blob, dims).map(Some)
    }

    /// Load vectors for many fragments; ids without one are left out
    pub async fn get_embeddings(
        &self,
        fragment_ids: &[String],
        provider: &str,
        model: &str,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut seen = HashSet::new();
        let unique: Vec<&str> = fragment_ids
            .iter()
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect();

        let mut vectors = HashMap::with_capacity(unique.len());
        for batch in unique.chunks(LOOKUP_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT fragment_id, dims, vector FROM embeddings \
                 WHERE provider = ? AND model = ? AND fragment_id IN ({placeholders})"
            );

            let mut query = sqlx::query(&sql).bind(provider).bind(model);
            for id in batch {
                query = query.bind(*id);
            }

            let rows = query.fetch_all(self.pool()).await.op("get_embeddings")?;
            for row in rows {
                let id: String = row.try_get("fragment_id").op("get_embeddings")?;
                let dims: i64 = row.try_get("dims").op("get_embeddings")?;
                let blob: Vec<u8> = row.try_get("vector").op("get_embeddings")?;
                vectors.insert(id, decode_vector(&blob, dims)?);
            }
        }

        Ok(vectors)
    }

    /// Fragments with no vector for this provider/model, oldest first
    pub async fn needs_embedding(
        &self,
        agent: Option<&str>,
        provider: &str,
        model: &str,
    ) -> Result<Vec<Fragment>> {
        let sql = format!(
            r#"
            SELECT {FRAGMENT_COLUMNS} FROM fragments f
            WHERE (? IS NULL OR f.agent = ?)
              AND NOT EXISTS (
                SELECT 1 FROM embeddings e
                WHERE e.fragment_id = f.id AND e.provider = ? AND e.model = ?
              )
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(agent)
            .bind(agent)
            .bind(provider)
            .bind(model)
            .fetch_all(self.pool())
            .await
            .op("needs_embedding")?;

        let mut pending = rows.iter().map(row_to_fragment).collect::<Result<Vec<_>>>()?;
        pending.sort_by(|a, b| newest_first(b, a));
        Ok(pending)
    }

    /// Number of cached vectors for a provider/model
    pub async fn count_embeddings(&self, provider: &str, model: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM embeddings WHERE provider = ? AND model = ?")
                .bind(provider)
                .bind(model)
                .fetch_one(self.pool())
                .await
                .op("count_embeddings")?;
        Ok(count as u64)
    }
}

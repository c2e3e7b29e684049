//! Vector search integration for semantic similarity

use crate::embedding_cache::decode_vector;
use crate::error::{require, DbContext, MemoryError, Result};
use crate::store::{row_to_fragment, FragmentStore, FRAGMENT_COLUMNS};
use crate::types::{Fragment, VectorHit};

use futures::TryStreamExt;
use sqlx::Row;
use std::cmp::Ordering;

/// Result count used when the caller passes `0`
pub const DEFAULT_LIMIT: usize = 10;

impl FragmentStore {
    /// Full-scan cosine search over one provider/model's vectors.
    ///
    /// Only vectors whose dimension matches the query are compared. Rows
    /// with an undecodable blob are skipped.
    pub async fn vector_search(
        &self,
        agent: Option<&str>,
        provider: &str,
        model: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        require("provider", provider)?;
        require("model", model)?;
        if query.is_empty() {
            return Err(MemoryError::Validation("query vector is empty".to_string()));
        }
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };

        let sql = format!(
            r#"
            SELECT {FRAGMENT_COLUMNS}, e.dims AS vector_dims, e.vector AS vector_blob
            FROM embeddings e
            JOIN fragments f ON f.id = e.fragment_id
            WHERE e.provider = ? AND e.model = ? AND e.dims = ?
              AND (? IS NULL OR f.agent = ?)
            "#
        );

        let mut rows = sqlx::query(&sql)
            .bind(provider)
            .bind(model)
            .bind(query.len() as i64)
            .bind(agent)
            .bind(agent)
            .fetch(self.pool());

        let mut scored: Vec<(Fragment, f32)> = Vec::new();
        while let Some(row) = rows.try_next().await.op("vector_search")? {
            let id: String = row.try_get("id").op("vector_search")?;
            let dims: i64 = row.try_get("vector_dims").op("vector_search")?;
            let blob: Vec<u8> = row.try_get("vector_blob").op("vector_search")?;

            let vector = match decode_vector(&blob, dims) {
                Ok(vector) => vector,
                Err(e) => {
                    tracing::warn!("Skipping embedding for fragment {}: {}", id, e);
                    continue;
                }
            };

            let similarity = cosine_similarity(query, &vector);
            scored.push((row_to_fragment(&row)?, similarity));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.0.updated_at.cmp(&a.0.updated_at))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (fragment, similarity))| VectorHit {
                fragment,
                similarity,
                rank: i + 1,
            })
            .collect())
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

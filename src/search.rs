//! Keyword search over the FTS5 mirror
//!
//! Provides BM25-ranked search over fragment content with:
//! - Punctuation-safe query building (every word quoted, OR-joined)
//! - Optional agent scoping
//! - Highlighted snippets around matched terms

use crate::error::{DbContext, Result};
use crate::store::{row_to_fragment, FragmentStore, FRAGMENT_COLUMNS};
use crate::types::KeywordHit;

use sqlx::Row;

/// Result count used when the caller passes `0`
pub const DEFAULT_LIMIT: usize = 10;

/// Hard cap on keyword results
pub const MAX_LIMIT: usize = 100;

/// Build an FTS5 MATCH expression that cannot be a syntax error.
///
/// Words without any letter or digit are dropped: the tokenizer would
/// discard them anyway. Returns `None` when nothing searchable remains.
pub(crate) fn build_match_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn effective_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

impl FragmentStore {
    /// BM25 keyword search, most relevant first.
    ///
    /// Never bumps access or changes scores.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        agent: Option<&str>,
    ) -> Result<Vec<KeywordHit>> {
        let Some(match_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        let limit = effective_limit(limit);

        let sql = format!(
            r#"
            SELECT {FRAGMENT_COLUMNS},
                   bm25(fragments_fts) AS rank_score,
                   snippet(fragments_fts, 0, '[', ']', '…', 12) AS snippet
            FROM fragments_fts
            JOIN fragments f ON f.storage_key = fragments_fts.rowid
            WHERE fragments_fts MATCH ?
              AND (? IS NULL OR f.agent = ?)
            ORDER BY rank_score ASC, f.storage_key DESC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(&match_query)
            .bind(agent)
            .bind(agent)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await
            .op("keyword_search")?;

        let mut hits = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let bm25: f64 = row.try_get("rank_score").op("keyword_search")?;
            hits.push(KeywordHit {
                fragment: row_to_fragment(row)?,
                // FTS5 bm25 is negative, lower is better
                score: -bm25,
                snippet: row.try_get("snippet").op("keyword_search")?,
                rank: i + 1,
            });
        }

        tracing::debug!("Keyword search {:?} returned {} hits", query, hits.len());
        Ok(hits)
    }
}

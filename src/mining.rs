//! Per-session resume points for the external miner

use crate::error::{require, DbContext, Result};
use crate::store::FragmentStore;
use crate::timestamp;
use crate::types::MiningState;

use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::BTreeMap;

impl FragmentStore {
    /// Load the resume point for a session
    pub async fn get_state(&self, session_id: &str) -> Result<Option<MiningState>> {
        let row = sqlx::query(
            "SELECT session_id, agent, last_mined_offset, mined_at FROM mining_state WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await
        .op("get_state")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mined_at: Option<String> = row.try_get("mined_at").op("get_state")?;
        Ok(Some(MiningState {
            session_id: row.try_get("session_id").op("get_state")?,
            agent: row.try_get("agent").op("get_state")?,
            last_mined_offset: row.try_get("last_mined_offset").op("get_state")?,
            mined_at: mined_at.as_deref().and_then(timestamp::parse),
        }))
    }

    /// Insert or replace a session's resume point; `mined_at` defaults to now
    pub async fn upsert_state(&self, state: &MiningState) -> Result<()> {
        require("session_id", &state.session_id)?;
        require("agent", &state.agent)?;

        let mined_at = timestamp::format(state.mined_at.unwrap_or_else(Utc::now));
        sqlx::query(
            r#"
            INSERT INTO mining_state (session_id, agent, last_mined_offset, mined_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                agent = excluded.agent,
                last_mined_offset = excluded.last_mined_offset,
                mined_at = excluded.mined_at
            "#,
        )
        .bind(&state.session_id)
        .bind(&state.agent)
        .bind(state.last_mined_offset)
        .bind(&mined_at)
        .execute(self.pool())
        .await
        .op("upsert_state")?;

        tracing::debug!(
            "Session {} mined to offset {} for {}",
            state.session_id,
            state.last_mined_offset,
            state.agent
        );
        Ok(())
    }

    /// Most recent mining time per agent.
    ///
    /// Folded in Rust rather than with SQL `MAX` because older rows hold
    /// timestamps in formats that do not sort as text.
    pub async fn last_mined_per_agent(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let rows = sqlx::query("SELECT agent, mined_at FROM mining_state")
            .fetch_all(self.pool())
            .await
            .op("last_mined_per_agent")?;

        let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for row in rows {
            let agent: String = row.try_get("agent").op("last_mined_per_agent")?;
            let raw: Option<String> = row.try_get("mined_at").op("last_mined_per_agent")?;

            let Some(mined_at) = raw.as_deref().and_then(timestamp::parse) else {
                tracing::warn!("Ignoring unreadable mined_at {:?} for agent {}", raw, agent);
                continue;
            };

            latest
                .entry(agent)
                .and_modify(|current| *current = (*current).max(mined_at))
                .or_insert(mined_at);
        }

        Ok(latest)
    }
}

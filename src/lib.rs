//! # Magpie - durable memory store for AI agents
//!
//! Short text fragments keyed by `(agent, path)`, kept searchable by
//! keyword (an FTS5 mirror written in the same transaction as the fragment
//! table) and by embedding similarity, with half-life decay and garbage
//! collection of fragments nobody uses.
//!
//! ```no_run
//! use magpie::{FragmentStore, NewFragment, StoreConfig};
//!
//! # async fn demo() -> magpie::Result<()> {
//! let store = FragmentStore::open(&StoreConfig::from_env()?).await?;
//! store
//!     .create(NewFragment::new("assistant", "preferences/editor", "prefers helix"))
//!     .await?;
//! let hits = store.keyword_search("helix", 5, Some("assistant")).await?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
pub mod embedding_cache;
pub mod error;
pub mod maintenance;
pub mod mining;
mod mirror;
pub mod paths;
pub mod schema;
pub mod search;
pub mod store;
pub mod timestamp;
pub mod types;
pub mod vector_search;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use embedding::{
    backfill_embeddings, BackfillOptions, EmbedRequest, EmbedTask, Embedded, Embedder,
    HashEmbedder, TokenUsage,
};
pub use error::{MemoryError, Result};
pub use maintenance::{
    decay_score, run_maintenance, MaintenanceConfig, MaintenanceConfigBuilder, MaintenanceReport,
    DEFAULT_HALF_LIFE_DAYS, GC_THRESHOLD,
};
pub use paths::{resolve_db_path, DbLocation};
pub use store::FragmentStore;
pub use types::{
    Fragment, FragmentId, KeywordHit, ListOptions, MiningState, MirrorReport, NewFragment,
    StorageKey, StoreStats, UpdateOutcome, VectorHit,
};
pub use vector_search::cosine_similarity;

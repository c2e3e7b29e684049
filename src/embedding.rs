//! Embedder boundary and the embedding backfill job

use crate::error::{MemoryError, Result};
use crate::store::FragmentStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the vectors will be used for; some providers embed differently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedTask {
    SearchQuery,
    SearchDocument,
}

#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub texts: Vec<String>,
    pub model: String,
    /// Requested output size, for providers that can truncate
    pub dimensions: Option<usize>,
    pub task: Option<EmbedTask>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Embedded {
    pub model: String,
    /// One vector per input text, in order
    pub vectors: Vec<Vec<f32>>,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name under which vectors are cached
    fn provider(&self) -> &str;

    async fn embed(&self, request: EmbedRequest) -> Result<Embedded>;
}

/// Zero-config embedder.
///
/// Deterministic and offline (feature hashing over word tokens). Useful for
/// tests and for wiring the pipeline before a real provider is configured.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub const PROVIDER: &'static str = "hash";
    pub const MODEL: &'static str = "fnv-bag-of-words";

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_one(&self, text: &str, dimension: usize) -> (Vec<f32>, u64) {
        let mut vec = vec![0.0f32; dimension];
        let mut token_count = 0u64;

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            token_count += 1;
            let mut hash = 1469598103934665603u64;
            for b in token.to_lowercase().bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(1099511628211u64);
            }

            let idx = (hash % dimension as u64) as usize;
            vec[idx] += 1.0;
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }

        (vec, token_count)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    async fn embed(&self, request: EmbedRequest) -> Result<Embedded> {
        let dimension = request.dimensions.unwrap_or(self.dimension).max(1);

        let mut usage = TokenUsage::default();
        let vectors: Vec<Vec<f32>> = request
            .texts
            .iter()
            .map(|text| {
                let (vector, tokens) = self.embed_one(text, dimension);
                usage.prompt_tokens += tokens;
                vector
            })
            .collect();
        usage.total_tokens = usage.prompt_tokens;

        Ok(Embedded {
            model: request.model,
            vectors,
            usage,
        })
    }
}

/// Options for [`backfill_embeddings`]
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub agent: Option<String>,
    pub model: String,
    pub dimensions: Option<usize>,
    /// Texts sent per embed call
    pub batch_size: usize,
}

impl BackfillOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            agent: None,
            model: model.into(),
            dimensions: None,
            batch_size: 32,
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Embed every fragment that has no vector for this provider/model.
///
/// Returns the number of vectors stored. Batches already stored stay stored
/// if a later batch fails. A fragment edited while its batch was embedding is
/// left for the next run.
pub async fn backfill_embeddings(
    store: &FragmentStore,
    embedder: &dyn Embedder,
    options: &BackfillOptions,
) -> Result<usize> {
    let provider = embedder.provider();
    let pending = store
        .needs_embedding(options.agent.as_deref(), provider, &options.model)
        .await?;

    let mut stored = 0;
    let mut usage = TokenUsage::default();
    for batch in pending.chunks(options.batch_size.max(1)) {
        let request = EmbedRequest {
            texts: batch.iter().map(|f| f.content.clone()).collect(),
            model: options.model.clone(),
            dimensions: options.dimensions,
            task: Some(EmbedTask::SearchDocument),
        };
        let embedded = embedder.embed(request).await?;

        if embedded.vectors.len() != batch.len() {
            return Err(MemoryError::Embedding(format!(
                "{provider} returned {} vectors for {} texts",
                embedded.vectors.len(),
                batch.len()
            )));
        }

        for (fragment, vector) in batch.iter().zip(&embedded.vectors) {
            let written = store
                .upsert_embedding_if_unchanged(
                    &fragment.id,
                    &fragment.content,
                    provider,
                    &options.model,
                    vector.len(),
                    vector,
                )
                .await?;
            if written {
                stored += 1;
            } else {
                tracing::debug!("Fragment {} changed while embedding; skipped", fragment.id);
            }
        }
        usage.prompt_tokens += embedded.usage.prompt_tokens;
        usage.total_tokens += embedded.usage.total_tokens;
    }

    tracing::info!(
        "Backfilled {} {}/{} embeddings ({} tokens)",
        stored,
        provider,
        options.model,
        usage.total_tokens
    );
    Ok(stored)
}

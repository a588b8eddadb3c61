//! Text-embedding providers and the vector helpers the matcher builds on.

pub mod openai;

pub use openai::OpenAiEmbedding;

use crate::config::EmbeddingConfig;
use async_trait::async_trait;

/// Converts text into a fixed-dimension vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Requested vector dimensionality.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Provider used when embeddings are switched off. Every call fails, so
/// indexing degrades to "no vector" and scans report the provider as unavailable.
pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn name(&self) -> &str {
        "none"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("embedding provider disabled (embedding.provider = \"none\")")
    }
}

/// Build the configured provider: "openai" | "none" | "custom:URL".
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Box<dyn EmbeddingProvider> {
    let provider = config.provider.trim();
    let api_key = config.api_key.as_deref();

    match provider {
        "openai" => Box::new(OpenAiEmbedding::new(
            openai::OPENAI_BASE_URL,
            api_key,
            &config.model,
            config.dimensions,
            config.timeout_secs,
        )),
        "none" => Box::new(NoopEmbedding),
        other => match other.strip_prefix("custom:") {
            Some(base_url) if !base_url.trim().is_empty() => Box::new(OpenAiEmbedding::new(
                base_url.trim(),
                api_key,
                &config.model,
                config.dimensions,
                config.timeout_secs,
            )),
            _ => {
                tracing::warn!("Unknown embedding provider '{other}', embeddings disabled");
                Box::new(NoopEmbedding)
            }
        },
    }
}

/// Serialize a vector as consecutive little-endian `f32`s.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Inverse of [`encode_vector`]. Yields `bytes.len() / 4` floats; a trailing
/// partial float is ignored.
pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity accumulated in `f64`.
///
/// Returns 0.0 when the lengths differ, either vector is empty, or either
/// norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

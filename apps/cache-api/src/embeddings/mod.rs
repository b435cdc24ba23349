//! Embedding Adapter — the cache's only path to the external embedding service.
//!
//! Every call is bounded by a caller-supplied timeout and every vector is checked
//! against the deployment's fixed width. Failures are reported, never awaited on
//! indefinitely: the semantic tier treats them as a miss.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub mod openai;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Embedding width {actual} does not match configured width {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding service returned no vector")]
    EmptyResponse,
}

/// The external embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Wraps an `Embedder` with a timeout and a width check.
#[derive(Clone)]
pub struct EmbeddingAdapter {
    embedder: Arc<dyn Embedder>,
    dimension: usize,
}

impl EmbeddingAdapter {
    pub fn new(embedder: Arc<dyn Embedder>, dimension: usize) -> Self {
        Self {
            embedder,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn embed(&self, text: &str, timeout: Duration) -> Result<Vec<f32>, EmbeddingError> {
        let vector = tokio::time::timeout(timeout, self.embedder.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(timeout))??;

        if vector.is_empty() {
            return Err(EmbeddingError::EmptyResponse);
        }
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        debug!("Embedded {} chars into {} dims", text.len(), vector.len());
        Ok(vector)
    }
}

//! Embedding extraction behind a single provider trait.
//!
//! The in-process provider is the heuristic descriptor; the daemon also
//! plugs in a provider that delegates to the external worker process.

use crate::descriptor;
use crate::localize::LocalizerChain;
use crate::types::{Capture, Embedding, HEURISTIC_DIM};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("embedding worker failed: {0}")]
    Worker(String),
    #[error("expected {expected}-dim embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

/// Turns a capture into a fixed-length vector.
pub trait EmbeddingProvider {
    /// Short identifier used in logs and status output.
    fn name(&self) -> &'static str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    fn extract(&mut self, capture: &Capture<'_>) -> Result<Embedding, EmbedError>;
}

/// Localizer chain + handcrafted descriptor. Never fails on a decoded image.
#[derive(Default)]
pub struct HeuristicEmbedder {
    chain: LocalizerChain,
}

impl HeuristicEmbedder {
    pub fn new(chain: LocalizerChain) -> Self {
        Self { chain }
    }
}

impl EmbeddingProvider for HeuristicEmbedder {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn dimension(&self) -> usize {
        HEURISTIC_DIM
    }

    fn extract(&mut self, capture: &Capture<'_>) -> Result<Embedding, EmbedError> {
        let gray = capture.image.to_luma8();
        let located = self.chain.locate(&gray);
        let embedding = descriptor::describe(capture.image, located.region);

        if embedding.len() != HEURISTIC_DIM {
            return Err(EmbedError::Dimension {
                expected: HEURISTIC_DIM,
                actual: embedding.len(),
            });
        }

        tracing::debug!(
            strategy = located.strategy,
            region = ?located.region,
            "heuristic embedding extracted"
        );
        Ok(embedding)
    }
}

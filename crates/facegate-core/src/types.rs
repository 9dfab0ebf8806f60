use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Length of vectors produced by the in-process heuristic descriptor.
pub const HEURISTIC_DIM: usize = 1914;
/// Length of vectors produced by the external ArcFace worker.
pub const EXTERNAL_DIM: usize = 512;

/// Face embedding vector.
///
/// Serialized as a bare JSON array so the store can persist it as text and
/// read it back without loss. The length identifies the extractor that
/// produced it; vectors of different lengths are never compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Which extractor family a vector belongs to, derived from its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingFamily {
    Heuristic,
    External,
    Unknown,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn family(&self) -> EmbeddingFamily {
        match self.values.len() {
            HEURISTIC_DIM => EmbeddingFamily::Heuristic,
            EXTERNAL_DIM => EmbeddingFamily::External,
            _ => EmbeddingFamily::Unknown,
        }
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Cosine similarity clamped to [-1, 1].
    ///
    /// Both vectors are normalized first; a zero vector on either side
    /// yields 0.0. Mismatched lengths also yield 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Cosine distance, `1 - similarity`, in [0, 2].
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Serialize for storage as a JSON array.
    pub fn to_json(&self) -> String {
        // A Vec<f32> always serializes.
        serde_json::to_string(&self.values).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Vec<f32>>(text).map(Self::new)
    }
}

/// An enrolled user's template as seen by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub user_id: i64,
    pub name: String,
    pub embedding: Embedding,
}

/// One captured frame, kept both as the raw payload and decoded.
///
/// The raw bytes are what the external worker receives; in-process stages
/// work on the decoded image.
pub struct Capture<'a> {
    pub bytes: &'a [u8],
    pub image: &'a DynamicImage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[1.0, 2.0, 3.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let s = emb(&[1.0, 0.0]).similarity(&emb(&[-3.0, 0.0]));
        assert!((s + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
        assert_eq!(emb(&[0.0, 0.0]).distance(&emb(&[1.0, 0.0])), 1.0);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        assert_eq!(emb(&[1.0, 0.0]).similarity(&emb(&[1.0, 0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_similarity_is_scale_invariant() {
        let a = emb(&[0.3, -0.2, 0.9]);
        let b = emb(&[3.0, -2.0, 9.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_family_from_length() {
        assert_eq!(emb(&vec![0.0; HEURISTIC_DIM]).family(), EmbeddingFamily::Heuristic);
        assert_eq!(emb(&vec![0.0; EXTERNAL_DIM]).family(), EmbeddingFamily::External);
        assert_eq!(emb(&[0.0; 3]).family(), EmbeddingFamily::Unknown);
    }

    #[test]
    fn test_json_roundtrip_is_lossless() {
        let values = vec![0.1f32, -1.0e-7, 3.402_823_5e38, 0.333_333_34, f32::MIN_POSITIVE];
        let original = Embedding::new(values);
        let restored = Embedding::from_json(&original.to_json()).unwrap();
        assert_eq!(original.values.len(), restored.values.len());
        for (a, b) in original.values.iter().zip(restored.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_serializes_as_bare_array() {
        let json = serde_json::to_string(&emb(&[1.0, 2.5])).unwrap();
        assert_eq!(json, "[1.0,2.5]");
    }
}

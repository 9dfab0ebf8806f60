//! Request dispatch for one worker invocation.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use facegate_core::protocol::{self, FaceMatch, NamedEmbedding, WorkerResponse, WORKER_DISTANCE_THRESHOLD};
use image::DynamicImage;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("models unavailable: {0}")]
    Models(String),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

/// Turns an image into an embedding of its most confident face.
///
/// `Ok(None)` means no face was found.
pub trait FaceEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Option<Vec<f32>>, ServiceError>;
}

/// SCRFD + ArcFace, loaded on first use so distance-only requests never
/// touch the models.
pub struct OnnxEmbedder {
    model_dir: PathBuf,
    models: Option<(FaceDetector, FaceRecognizer)>,
}

impl OnnxEmbedder {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            models: None,
        }
    }

    fn load(dir: &Path) -> Result<(FaceDetector, FaceRecognizer), ServiceError> {
        let detector = FaceDetector::load(&dir.join(DETECTOR_MODEL)).map_err(|e| ServiceError::Models(e.to_string()))?;
        let recognizer =
            FaceRecognizer::load(&dir.join(RECOGNIZER_MODEL)).map_err(|e| ServiceError::Models(e.to_string()))?;
        Ok((detector, recognizer))
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(&mut self, image: &DynamicImage) -> Result<Option<Vec<f32>>, ServiceError> {
        let (detector, recognizer) = match &mut self.models {
            Some(models) => models,
            slot => slot.insert(Self::load(&self.model_dir)?),
        };
        let faces = detector.detect(image)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        tracing::debug!(confidence = face.confidence, faces = faces.len(), "using most confident face");
        Ok(Some(recognizer.extract(image, face)?))
    }
}

/// Cosine distance with a small epsilon guarding zero vectors.
///
/// `None` when the lengths differ.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt() + 1e-8;
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Some(1.0 - dot / (norm(a) * norm(b)))
}

fn decode_image(data: &Value) -> Result<DynamicImage, String> {
    let text = data
        .get("image")
        .and_then(Value::as_str)
        .ok_or("missing image")?;
    let bytes = protocol::decode_image(text).map_err(|e| format!("Invalid image data: {e}"))?;
    image::load_from_memory(&bytes).map_err(|e| format!("Invalid image data: {e}"))
}

fn vector(data: &Value, key: &str) -> Result<Vec<f32>, String> {
    let value = data.get(key).ok_or_else(|| format!("missing {key}"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("invalid {key}: {e}"))
}

pub struct Service<E> {
    embedder: E,
}

impl<E: FaceEmbedder> Service<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }

    /// Answer one raw request document. Never fails: every problem becomes
    /// a `success: false` response.
    pub fn handle_raw(&mut self, input: &str) -> WorkerResponse {
        let request: Value = match serde_json::from_str(input) {
            Ok(value) => value,
            Err(e) => return WorkerResponse::failure(format!("Service error: {e}")),
        };
        let kind = request.get("type").and_then(Value::as_str).unwrap_or_default();
        let data = request.get("data").cloned().unwrap_or(Value::Null);
        tracing::debug!(kind, "handling request");

        let result = match kind {
            "extract_embedding" => self.extract_embedding(&data),
            "calculate_distance" => calculate_distance(&data),
            "compare_faces" => self.compare_faces(&data),
            other => return WorkerResponse::failure(format!("Unknown request type: {other}")),
        };
        result.unwrap_or_else(|e| WorkerResponse::failure(format!("Processing error: {e}")))
    }

    fn embed(&mut self, image: &DynamicImage) -> Result<Option<Vec<f32>>, String> {
        self.embedder.embed(image).map_err(|e| {
            tracing::error!(error = %e, "embedding extraction failed");
            e.to_string()
        })
    }

    fn extract_embedding(&mut self, data: &Value) -> Result<WorkerResponse, String> {
        let image = decode_image(data)?;
        Ok(match self.embed(&image)? {
            Some(values) => WorkerResponse::embedding(values),
            None => WorkerResponse::no_face(" or embedding extraction failed"),
        })
    }

    fn compare_faces(&mut self, data: &Value) -> Result<WorkerResponse, String> {
        let image = decode_image(data)?;
        let Some(query) = self.embed(&image)? else {
            return Ok(WorkerResponse::no_face(" in query image"));
        };

        let entries = data
            .get("embeddings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut matches = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let entry: NamedEmbedding = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed gallery entry");
                    continue;
                }
            };
            let Some(distance) = cosine_distance(&query, &entry.embedding) else {
                tracing::warn!(index, name = entry.name, "skipping gallery entry with mismatched length");
                continue;
            };
            matches.push(FaceMatch {
                name: entry.name,
                distance,
                similarity: 1.0 - distance,
                is_match: distance <= WORKER_DISTANCE_THRESHOLD,
            });
        }
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        Ok(WorkerResponse {
            success: true,
            best_match: matches.first().cloned(),
            query_embedding: Some(query),
            matches: Some(matches),
            threshold: Some(WORKER_DISTANCE_THRESHOLD),
            ..Default::default()
        })
    }
}

fn calculate_distance(data: &Value) -> Result<WorkerResponse, String> {
    let a = vector(data, "embedding1")?;
    let b = vector(data, "embedding2")?;
    let distance = cosine_distance(&a, &b)
        .ok_or_else(|| format!("embedding lengths differ ({} vs {})", a.len(), b.len()))?;
    Ok(WorkerResponse {
        success: true,
        distance: Some(distance),
        similarity: Some(1.0 - distance),
        threshold: Some(WORKER_DISTANCE_THRESHOLD),
        is_match: Some(distance <= WORKER_DISTANCE_THRESHOLD),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::protocol::{encode_image, WorkerRequest};
    use image::ImageFormat;

    /// Embeds every image to a fixed vector, or finds no face.
    struct FixedEmbedder(Option<Vec<f32>>);

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&mut self, _image: &DynamicImage) -> Result<Option<Vec<f32>>, ServiceError> {
            Ok(self.0.clone())
        }
    }

    fn service(embedding: Option<Vec<f32>>) -> Service<FixedEmbedder> {
        Service::new(FixedEmbedder(embedding))
    }

    fn png() -> Vec<u8> {
        let mut bytes = std::io::Cursor::new(Vec::new());
        DynamicImage::new_rgb8(4, 4).write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn request(request: &WorkerRequest) -> String {
        serde_json::to_string(request).unwrap()
    }

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).unwrap().abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), None);
    }

    #[test]
    fn test_calculate_distance_reports_match() {
        let response = service(None).handle_raw(&request(&WorkerRequest::CalculateDistance {
            embedding1: vec![1.0, 0.1],
            embedding2: vec![1.0, 0.0],
        }));
        assert!(response.success);
        assert_eq!(response.is_match, Some(true));
        assert_eq!(response.threshold, Some(0.30));
        let distance = response.distance.unwrap();
        assert!((response.similarity.unwrap() - (1.0 - distance)).abs() < 1e-6);
    }

    #[test]
    fn test_calculate_distance_length_mismatch_fails() {
        let response = service(None).handle_raw(&request(&WorkerRequest::CalculateDistance {
            embedding1: vec![1.0],
            embedding2: vec![1.0, 0.0],
        }));
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Processing error"));
    }

    #[test]
    fn test_extract_embedding() {
        let response = service(Some(vec![0.6, 0.8])).handle_raw(&request(&WorkerRequest::extract(&png())));
        assert!(response.success);
        assert_eq!(response.embedding, Some(vec![0.6, 0.8]));
        assert_eq!(response.dimension, Some(2));
    }

    #[test]
    fn test_extract_accepts_data_url() {
        let raw = format!(
            r#"{{"type":"extract_embedding","data":{{"image":"data:image/png;base64,{}"}}}}"#,
            encode_image(&png())
        );
        assert!(service(Some(vec![1.0])).handle_raw(&raw).success);
    }

    #[test]
    fn test_no_face_is_unsuccessful() {
        let response = service(None).handle_raw(&request(&WorkerRequest::extract(&png())));
        assert!(!response.success);
        assert!(response.is_no_face());
        assert!(response.embedding.is_none());
    }

    #[test]
    fn test_invalid_image_is_unsuccessful() {
        let response = service(Some(vec![1.0])).handle_raw(&request(&WorkerRequest::extract(b"not an image")));
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Invalid image data"));
    }

    #[test]
    fn test_compare_faces_sorts_and_skips_bad_entries() {
        let raw = serde_json::json!({
            "type": "compare_faces",
            "data": {
                "image": encode_image(&png()),
                "embeddings": [
                    {"name": "far", "embedding": [0.0, 1.0]},
                    {"name": "short", "embedding": [1.0]},
                    {"name": "broken"},
                    {"name": "near", "embedding": [1.0, 0.05]},
                ],
            },
        })
        .to_string();
        let response = service(Some(vec![1.0, 0.0])).handle_raw(&raw);
        assert!(response.success);
        let matches = response.matches.unwrap();
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["near", "far"]);
        assert!(matches[0].is_match);
        assert!(!matches[1].is_match);
        assert_eq!(response.best_match.unwrap().name, "near");
        assert_eq!(response.query_embedding, Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_unknown_request_type() {
        let response = service(None).handle_raw(r#"{"type":"teleport","data":{}}"#);
        assert_eq!(response.error.as_deref(), Some("Unknown request type: teleport"));
    }

    #[test]
    fn test_malformed_json() {
        let response = service(None).handle_raw("{not json");
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Service error"));
    }

    #[test]
    fn test_missing_models_are_reported() {
        let mut service = Service::new(OnnxEmbedder::new("/nonexistent/facegate/models"));
        let response = service.handle_raw(&request(&WorkerRequest::extract(&png())));
        assert!(!response.success);
        assert!(!response.is_no_face());
        assert!(response.error.unwrap().contains("models unavailable"));
    }
}

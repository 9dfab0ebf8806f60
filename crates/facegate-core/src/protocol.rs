//! Wire format spoken with the external embedding worker.
//!
//! One JSON request on the worker's stdin, one JSON response on its stdout.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cosine distance at or below which the worker reports a match.
pub const WORKER_DISTANCE_THRESHOLD: f32 = 0.30;

/// Prefix of every error the worker returns when it finds no usable face.
/// Any other unsuccessful response is a worker fault.
pub const NO_FACE_ERROR: &str = "No face detected";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid base64 image: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEmbedding {
    pub name: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkerRequest {
    ExtractEmbedding {
        image: String,
    },
    CalculateDistance {
        embedding1: Vec<f32>,
        embedding2: Vec<f32>,
    },
    CompareFaces {
        image: String,
        embeddings: Vec<NamedEmbedding>,
    },
}

impl WorkerRequest {
    pub fn extract(image: &[u8]) -> Self {
        WorkerRequest::ExtractEmbedding {
            image: encode_image(image),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::ExtractEmbedding { .. } => "extract_embedding",
            WorkerRequest::CalculateDistance { .. } => "calculate_distance",
            WorkerRequest::CompareFaces { .. } => "compare_faces",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub name: String,
    pub distance: f32,
    pub similarity: f32,
    pub is_match: bool,
}

/// Single response shape for every request type; unused fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<FaceMatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_match: Option<FaceMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn no_face(detail: &str) -> Self {
        Self::failure(format!("{NO_FACE_ERROR}{detail}"))
    }

    pub fn is_no_face(&self) -> bool {
        !self.success && self.error.as_deref().is_some_and(|e| e.starts_with(NO_FACE_ERROR))
    }

    pub fn embedding(values: Vec<f32>) -> Self {
        Self {
            success: true,
            dimension: Some(values.len()),
            embedding: Some(values),
            ..Default::default()
        }
    }
}

pub fn encode_image(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 image, accepting an optional `data:<mime>;base64,` prefix.
pub fn decode_image(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let payload = match text.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => text,
    };
    Ok(STANDARD.decode(payload.trim())?)
}

/// Parse exactly one response document from worker stdout.
pub fn parse_response(stdout: &[u8]) -> Result<WorkerResponse, ProtocolError> {
    Ok(serde_json::from_slice(stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_value(WorkerRequest::extract(b"abc")).unwrap();
        assert_eq!(json["type"], "extract_embedding");
        assert_eq!(json["data"]["image"], "YWJj");
    }

    #[test]
    fn test_parse_calculate_distance_request() {
        let text = r#"{"type":"calculate_distance","data":{"embedding1":[1,0],"embedding2":[0,1]}}"#;
        let request: WorkerRequest = serde_json::from_str(text).unwrap();
        assert_eq!(request.kind(), "calculate_distance");
    }

    #[test]
    fn test_unknown_type_fails_to_parse() {
        let text = r#"{"type":"teleport","data":{}}"#;
        assert!(serde_json::from_str::<WorkerRequest>(text).is_err());
    }

    #[test]
    fn test_response_omits_unused_fields() {
        let json = serde_json::to_string(&WorkerResponse::failure("boom")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"boom"}"#);
    }

    #[test]
    fn test_only_no_face_errors_count_as_no_face() {
        assert!(WorkerResponse::no_face(" in query image").is_no_face());
        assert!(parse_response(br#"{"success":false,"error":"No face detected"}"#).unwrap().is_no_face());
        assert!(!WorkerResponse::failure("Processing error: models unavailable: x").is_no_face());
        assert!(!parse_response(br#"{"success":false}"#).unwrap().is_no_face());
    }

    #[test]
    fn test_parse_embedding_response() {
        let response = parse_response(br#"{"success":true,"embedding":[0.5,0.5],"dimension":2}"#).unwrap();
        assert!(response.success);
        assert_eq!(response.embedding.unwrap().len(), 2);
        assert_eq!(response.dimension, Some(2));
    }

    #[test]
    fn test_parse_garbage_response() {
        assert!(matches!(parse_response(b"Traceback ..."), Err(ProtocolError::Json(_))));
        assert!(parse_response(b"").is_err());
    }

    #[test]
    fn test_decode_image_strips_data_url() {
        assert_eq!(decode_image("data:image/png;base64,YWJj").unwrap(), b"abc");
        assert_eq!(decode_image("YWJj\n").unwrap(), b"abc");
        assert!(decode_image("@@@").is_err());
    }
}

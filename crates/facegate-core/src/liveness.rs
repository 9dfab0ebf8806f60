//! Presentation-attack detection via a binary ONNX classifier.
//!
//! The whole frame is resized to 128x128 RGB, normalized, and scored; the
//! single raw output is squashed through a sigmoid into a live probability.
//! Every failure path reports "not live" (fail-closed).

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

// --- Named constants ---
const LIVENESS_INPUT_SIZE: usize = 128;
const LIVENESS_MEAN: f32 = 127.5;
const LIVENESS_STD: f32 = 127.5;

/// Live probability at or above which a capture is accepted as live.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("liveness model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessReason {
    /// The classifier scored the capture below the threshold.
    SpoofSuspected,
    /// No model session is loaded.
    ModelUnavailable,
    /// Preprocessing or inference raised an error.
    InferenceError,
}

impl std::fmt::Display for LivenessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LivenessReason::SpoofSuspected => write!(f, "presentation attack suspected"),
            LivenessReason::ModelUnavailable => write!(f, "liveness model unavailable"),
            LivenessReason::InferenceError => write!(f, "liveness check failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessReport {
    pub is_live: bool,
    /// Live probability in [0, 1].
    pub confidence: f32,
    pub threshold: f32,
    pub reasons: Vec<LivenessReason>,
    pub processing_time_ms: u64,
}

impl LivenessReport {
    fn scored(probability: f32, threshold: f32, elapsed: Duration) -> Self {
        let is_live = probability >= threshold;
        Self {
            is_live,
            confidence: probability,
            threshold,
            reasons: if is_live {
                Vec::new()
            } else {
                vec![LivenessReason::SpoofSuspected]
            },
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    /// Fail-closed report for a failed or missing detector.
    pub fn rejected(reason: LivenessReason, threshold: f32, elapsed: Duration) -> Self {
        Self {
            is_live: false,
            confidence: 0.0,
            threshold,
            reasons: vec![reason],
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn summary(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Response body of the liveness-only request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub success: bool,
    pub is_live: bool,
    pub confidence: f32,
    pub threshold: f32,
    pub reasons: Vec<LivenessReason>,
}

impl From<&LivenessReport> for LivenessResponse {
    fn from(report: &LivenessReport) -> Self {
        Self {
            success: true,
            is_live: report.is_live,
            confidence: report.confidence,
            threshold: report.threshold,
            reasons: report.reasons.clone(),
        }
    }
}

/// Liveness stage as seen by the verification pipeline.
pub trait LivenessCheck {
    fn check(&mut self, image: &DynamicImage) -> LivenessReport;
}

/// ONNX-backed binary live/spoof classifier.
pub struct LivenessDetector {
    session: Session,
    threshold: f32,
}

impl LivenessDetector {
    /// Load the classifier from an ONNX file.
    pub fn load(model_path: &Path, threshold: f32) -> Result<Self, LivenessError> {
        if !model_path.exists() {
            return Err(LivenessError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            threshold,
            "loaded liveness model"
        );

        Ok(Self { session, threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Live probability for a frame.
    pub fn probability(&mut self, image: &DynamicImage) -> Result<f32, LivenessError> {
        let input = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("liveness score: {e}")))?;
        let logit = raw
            .first()
            .copied()
            .ok_or_else(|| LivenessError::InferenceFailed("empty output tensor".into()))?;

        Ok(sigmoid(logit))
    }

    /// Resize to 128x128 (aspect ratio not preserved) into a NCHW RGB tensor.
    fn preprocess(image: &DynamicImage) -> Array4<f32> {
        let size = LIVENESS_INPUT_SIZE;
        let rgb = image
            .resize_exact(size as u32, size as u32, FilterType::Lanczos3)
            .to_rgb8();
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - LIVENESS_MEAN) / LIVENESS_STD;
            }
        }

        tensor
    }
}

impl LivenessCheck for LivenessDetector {
    fn check(&mut self, image: &DynamicImage) -> LivenessReport {
        let started = Instant::now();
        match self.probability(image) {
            Ok(probability) => {
                let report = LivenessReport::scored(probability, self.threshold, started.elapsed());
                tracing::debug!(
                    probability,
                    is_live = report.is_live,
                    elapsed_ms = report.processing_time_ms,
                    "liveness scored"
                );
                report
            }
            Err(e) => {
                tracing::error!(error = %e, "liveness inference failed; rejecting capture");
                LivenessReport::rejected(
                    LivenessReason::InferenceError,
                    self.threshold,
                    started.elapsed(),
                )
            }
        }
    }
}

/// Logistic function mapping a raw logit to (0, 1).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

//! Image quality gate — a cheap histogram pass that rejects unusable frames
//! before liveness inference or embedding extraction run.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

// --- Named constants ---
const MIN_DIMENSION: u32 = 100;
const RESOLUTION_PENALTY: f64 = 0.4;
const MIN_MEAN_BRIGHTNESS: f32 = 20.0;
const MAX_MEAN_BRIGHTNESS: f32 = 235.0;
const BRIGHTNESS_PENALTY: f64 = 0.3;
/// Score reported when the payload cannot be decoded at all.
const NEUTRAL_SCORE: f32 = 0.8;

/// Below this score the pipeline stops before any further stage.
pub const DEFAULT_MIN_QUALITY: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    LowResolution,
    BadBrightness,
}

impl std::fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityIssue::LowResolution => write!(f, "resolution too low"),
            QualityIssue::BadBrightness => write!(f, "brightness out of range"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Quality score in [0, 1].
    pub score: f32,
    pub issues: Vec<QualityIssue>,
}

impl QualityReport {
    pub fn passes(&self, min_score: f32) -> bool {
        self.score >= min_score
    }

    /// Issues joined into one human-readable string.
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Score a decoded frame.
pub fn assess(image: &DynamicImage) -> QualityReport {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let mut issues = Vec::new();
    let mut score = 1.0f64;

    if width < MIN_DIMENSION || height < MIN_DIMENSION {
        issues.push(QualityIssue::LowResolution);
        score -= RESOLUTION_PENALTY;
    }

    let brightness = mean_from_histogram(&histogram(gray.as_raw()));
    if !(MIN_MEAN_BRIGHTNESS..=MAX_MEAN_BRIGHTNESS).contains(&brightness) {
        issues.push(QualityIssue::BadBrightness);
        score -= BRIGHTNESS_PENALTY;
    }

    tracing::debug!(width, height, brightness, score, "quality assessed");

    // Penalties are decimal; round so 1 - 0.4 - 0.3 lands exactly on 0.3.
    let score = ((score.max(0.0) * 10_000.0).round() / 10_000.0) as f32;
    QualityReport { score, issues }
}

/// Score a raw payload. Undecodable input gets a neutral passing score;
/// rejecting it is the caller's decision, not the gate's.
pub fn assess_bytes(bytes: &[u8]) -> QualityReport {
    match image::load_from_memory(bytes) {
        Ok(image) => assess(&image),
        Err(e) => {
            tracing::debug!(error = %e, "quality gate could not decode image; neutral score");
            QualityReport {
                score: NEUTRAL_SCORE,
                issues: Vec::new(),
            }
        }
    }
}

/// 256-bin grayscale intensity histogram.
fn histogram(gray: &[u8]) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for &p in gray {
        hist[p as usize] += 1;
    }
    hist
}

fn mean_from_histogram(hist: &[u64; 256]) -> f32 {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let weighted: u64 = hist
        .iter()
        .enumerate()
        .map(|(level, &count)| level as u64 * count)
        .sum();
    (weighted as f64 / total as f64) as f32
}

//! Verification pipeline: quality -> liveness -> embedding -> matching.
//!
//! Stages run in order and stop at the first rejection so that cheap checks
//! shield the expensive ones. Nothing here returns `Err`: every failure is
//! folded into a [`VerificationOutcome`] carrying the reports gathered so far.

use crate::embedding::{EmbedError, EmbeddingProvider};
use crate::liveness::{LivenessCheck, LivenessReport};
use crate::matcher::{MatchCandidate, MatchDecision, MatchError, MatchPolicy, MatchReport, TemplateMatcher};
use crate::quality::{self, QualityReport, DEFAULT_MIN_QUALITY};
use crate::types::{Capture, Template};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Quality,
    Liveness,
    Embedding,
    Matching,
}

/// Why a verification did not recognize anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    InvalidInput,
    PoorQuality,
    SpoofDetected,
    NoFaceDetected,
    WorkerFailure,
    EmptyGallery,
    LowSimilarity,
    AmbiguousMatch,
}

impl Reason {
    /// Rejections after a completed comparison; the request itself succeeded.
    pub fn is_match_rejection(&self) -> bool {
        matches!(self, Reason::LowSimilarity | Reason::AmbiguousMatch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub min_quality: f32,
    pub policy: MatchPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_quality: DEFAULT_MIN_QUALITY,
            policy: MatchPolicy::default(),
        }
    }
}

/// Everything one verification produced.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    /// Last stage that ran.
    pub stage: Stage,
    /// `None` when a user was recognized.
    pub reason: Option<Reason>,
    pub message: Option<String>,
    pub quality: Option<QualityReport>,
    pub liveness: Option<LivenessReport>,
    pub matches: Option<MatchReport>,
    pub elapsed: Duration,
}

impl VerificationOutcome {
    fn stopped(stage: Stage, reason: Reason, message: String, started: Instant) -> Self {
        Self {
            stage,
            reason: Some(reason),
            message: Some(message),
            quality: None,
            liveness: None,
            matches: None,
            elapsed: started.elapsed(),
        }
    }

    /// The accepted candidate, if recognition succeeded.
    pub fn recognized(&self) -> Option<&MatchCandidate> {
        match self.reason {
            None => self.matches.as_ref().and_then(MatchReport::accepted),
            Some(_) => None,
        }
    }

    /// True when later stages were skipped by a quality or liveness rejection.
    pub fn early_exit(&self) -> bool {
        matches!(self.reason, Some(Reason::PoorQuality | Reason::SpoofDetected))
    }

    pub fn response(&self) -> VerificationResponse {
        let best = self.matches.as_ref().and_then(MatchReport::best);
        let recognized = self.recognized();
        VerificationResponse {
            success: match self.reason {
                None => true,
                Some(reason) => reason.is_match_rejection(),
            },
            recognized: recognized.is_some(),
            user_id: recognized.map(|c| c.user_id),
            user_name: recognized.map(|c| c.name.clone()),
            confidence: best.map(|c| c.similarity),
            similarity: best.map(|c| c.similarity),
            threshold: self.matches.as_ref().map(|m| m.threshold),
            confidence_gap: self.matches.as_ref().map(|m| m.confidence_gap),
            is_live: self.liveness.as_ref().map(|l| l.is_live),
            quality: self.quality.clone(),
            anti_spoofing: self.liveness.clone(),
            processing_time_ms: self.elapsed.as_millis() as u64,
            early_exit: self.early_exit(),
            reason: self.reason,
            error: self.message.clone(),
        }
    }
}

/// JSON body returned for a verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub success: bool,
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub confidence: Option<f32>,
    pub similarity: Option<f32>,
    pub threshold: Option<f32>,
    pub confidence_gap: Option<f32>,
    pub is_live: Option<bool>,
    pub quality: Option<QualityReport>,
    pub anti_spoofing: Option<LivenessReport>,
    pub processing_time_ms: u64,
    pub early_exit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct VerificationPipeline {
    config: PipelineConfig,
    matcher: TemplateMatcher,
}

impl Default for VerificationPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl VerificationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            matcher: TemplateMatcher::new(config.policy),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full verification with liveness.
    pub fn verify(
        &self,
        bytes: &[u8],
        liveness: &mut dyn LivenessCheck,
        embedder: &mut dyn EmbeddingProvider,
        gallery: &[Template],
    ) -> VerificationOutcome {
        self.run(bytes, Some(liveness), embedder, gallery)
    }

    /// Quality, embedding and matching only. Diagnostic path.
    pub fn recognize(
        &self,
        bytes: &[u8],
        embedder: &mut dyn EmbeddingProvider,
        gallery: &[Template],
    ) -> VerificationOutcome {
        self.run(bytes, None, embedder, gallery)
    }

    /// Empty or undecodable bytes are an input error (`InvalidInput` at the
    /// decode stage), never a quality rejection.
    fn run(
        &self,
        bytes: &[u8],
        liveness: Option<&mut dyn LivenessCheck>,
        embedder: &mut dyn EmbeddingProvider,
        gallery: &[Template],
    ) -> VerificationOutcome {
        let started = Instant::now();

        if bytes.is_empty() {
            return VerificationOutcome::stopped(
                Stage::Decode,
                Reason::InvalidInput,
                "no image provided".into(),
                started,
            );
        }
        let image = match image::load_from_memory(bytes) {
            Ok(image) => image,
            Err(e) => {
                tracing::debug!(error = %e, len = bytes.len(), "image decode failed");
                return VerificationOutcome::stopped(
                    Stage::Decode,
                    Reason::InvalidInput,
                    format!("image could not be decoded: {e}"),
                    started,
                );
            }
        };

        let quality = quality::assess(&image);
        tracing::info!(score = quality.score, issues = ?quality.issues, "quality stage");
        if !quality.passes(self.config.min_quality) {
            let mut outcome = VerificationOutcome::stopped(
                Stage::Quality,
                Reason::PoorQuality,
                format!("image quality too low: {}", quality.summary()),
                started,
            );
            outcome.quality = Some(quality);
            return outcome;
        }

        let mut outcome = VerificationOutcome {
            stage: Stage::Quality,
            reason: None,
            message: None,
            quality: Some(quality),
            liveness: None,
            matches: None,
            elapsed: Duration::ZERO,
        };

        if let Some(liveness) = liveness {
            outcome.stage = Stage::Liveness;
            let report = liveness.check(&image);
            tracing::info!(
                is_live = report.is_live,
                confidence = report.confidence,
                elapsed_ms = report.processing_time_ms,
                "liveness stage"
            );
            let is_live = report.is_live;
            let summary = report.summary();
            outcome.liveness = Some(report);
            if !is_live {
                outcome.reason = Some(Reason::SpoofDetected);
                outcome.message = Some(format!("spoof suspected: {summary}"));
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        }

        outcome.stage = Stage::Embedding;
        if gallery.is_empty() {
            outcome.reason = Some(Reason::EmptyGallery);
            outcome.message = Some("no users enrolled".into());
            outcome.elapsed = started.elapsed();
            return outcome;
        }

        let capture = Capture {
            bytes,
            image: &image,
        };
        let query = match embedder.extract(&capture) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!(provider = embedder.name(), error = %e, "embedding stage failed");
                let reason = match e {
                    EmbedError::NoFaceDetected => Reason::NoFaceDetected,
                    EmbedError::Decode(_) => Reason::InvalidInput,
                    EmbedError::Worker(_) | EmbedError::Dimension { .. } => Reason::WorkerFailure,
                };
                outcome.reason = Some(reason);
                outcome.message = Some(match reason {
                    Reason::NoFaceDetected => "no face detected".into(),
                    Reason::InvalidInput => e.to_string(),
                    _ => "embedding service unavailable".into(),
                });
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        outcome.stage = Stage::Matching;
        match self.matcher.search(&query, gallery) {
            Ok(report) => {
                let best = report.best().map(|c| (c.name.clone(), c.similarity));
                outcome.reason = match report.decision {
                    MatchDecision::Accepted => None,
                    MatchDecision::LowSimilarity => Some(Reason::LowSimilarity),
                    MatchDecision::AmbiguousMatch => Some(Reason::AmbiguousMatch),
                };
                outcome.message = outcome.reason.map(|reason| match reason {
                    Reason::LowSimilarity => format!(
                        "face not recognized: similarity {:.3} below {:.2}",
                        best.as_ref().map_or(0.0, |b| b.1),
                        report.threshold
                    ),
                    _ => format!(
                        "face not recognized: confidence gap {:.3} below {:.2}",
                        report.confidence_gap, self.config.policy.min_confidence_gap
                    ),
                });
                tracing::info!(
                    best = ?best,
                    gap = report.confidence_gap,
                    decision = ?report.decision,
                    "matching stage"
                );
                outcome.matches = Some(report);
            }
            Err(MatchError::EmptyGallery) => {
                outcome.reason = Some(Reason::EmptyGallery);
                outcome.message = Some(format!(
                    "no enrolled templates of dimension {}",
                    query.len()
                ));
            }
        }

        outcome.elapsed = started.elapsed();
        outcome
    }
}

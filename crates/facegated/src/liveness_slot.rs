//! Long-lived liveness model handle owned by the engine thread.
//!
//! The slot provisions the model once at engine start. Requests are served
//! from the engine's single queue, so first-use readiness is single-flight:
//! callers arriving during provisioning wait in the queue. The download is
//! bounded by [`ModelSource::download_timeout`]. If provisioning fails the
//! slot reports "model unavailable" (fail-closed) and retries after a
//! cooldown.

use crate::provision;
use facegate_core::liveness::{LivenessCheck, LivenessReason, LivenessReport};
use facegate_core::LivenessDetector;
use image::DynamicImage;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

const RETRY_COOLDOWN: Duration = Duration::from_secs(60);

/// Where the liveness model comes from.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub url: String,
    pub path: PathBuf,
    pub sha256: Option<String>,
    pub download_timeout: Duration,
}

enum SlotState {
    Pending,
    Ready(LivenessDetector),
    Unavailable { since: Instant, error: String },
}

pub struct LivenessSlot {
    state: SlotState,
    source: ModelSource,
    threshold: f32,
    runtime: Handle,
    client: reqwest::Client,
}

impl LivenessSlot {
    pub fn new(source: ModelSource, threshold: f32, runtime: Handle) -> Self {
        Self {
            state: SlotState::Pending,
            source,
            threshold,
            runtime,
            client: provision::download_client().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            }),
        }
    }

    /// Download (if needed) and load the model. Blocks the calling thread.
    pub fn provision(&mut self) {
        let source = self.source.clone();
        let fetched = self.runtime.block_on(provision::ensure_model(
            &self.client,
            &source.url,
            &source.path,
            source.sha256.as_deref(),
            source.download_timeout,
        ));

        self.state = match fetched
            .map_err(|e| e.to_string())
            .and_then(|path| LivenessDetector::load(&path, self.threshold).map_err(|e| e.to_string()))
        {
            Ok(detector) => {
                tracing::info!(path = %source.path.display(), "liveness model ready");
                SlotState::Ready(detector)
            }
            Err(error) => {
                tracing::error!(%error, "liveness model unavailable; captures will be rejected");
                SlotState::Unavailable {
                    since: Instant::now(),
                    error,
                }
            }
        };
    }

    fn ensure_ready(&mut self) {
        let retry = match &self.state {
            SlotState::Pending => true,
            SlotState::Unavailable { since, .. } => since.elapsed() >= RETRY_COOLDOWN,
            SlotState::Ready(_) => false,
        };
        if retry {
            self.provision();
        }
    }

    pub fn state_label(&self) -> &'static str {
        match self.state {
            SlotState::Pending => "pending",
            SlotState::Ready(_) => "ready",
            SlotState::Unavailable { .. } => "unavailable",
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            SlotState::Unavailable { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl LivenessCheck for LivenessSlot {
    fn check(&mut self, image: &DynamicImage) -> LivenessReport {
        let started = Instant::now();
        self.ensure_ready();
        match &mut self.state {
            SlotState::Ready(detector) => detector.check(image),
            _ => LivenessReport::rejected(
                LivenessReason::ModelUnavailable,
                self.threshold,
                started.elapsed(),
            ),
        }
    }
}

use crate::liveness_slot::LivenessSlot;
use facegate_core::embedding::{EmbedError, EmbeddingProvider};
use facegate_core::liveness::{LivenessCheck, LivenessReport};
use facegate_core::types::{Capture, Embedding, Template};
use facegate_core::{VerificationOutcome, VerificationPipeline};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine's state for the status call.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub embedder: &'static str,
    pub dimension: usize,
    pub liveness: &'static str,
    pub liveness_error: Option<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Verify {
        image: Vec<u8>,
        gallery: Vec<Template>,
        reply: oneshot::Sender<VerificationOutcome>,
    },
    Recognize {
        image: Vec<u8>,
        gallery: Vec<Template>,
        reply: oneshot::Sender<VerificationOutcome>,
    },
    Liveness {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<LivenessReport, EngineError>>,
    },
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Quality, liveness, embedding and matching against `gallery`.
    pub async fn verify(
        &self,
        image: Vec<u8>,
        gallery: Vec<Template>,
    ) -> Result<VerificationOutcome, EngineError> {
        self.request(|reply| EngineRequest::Verify {
            image,
            gallery,
            reply,
        })
        .await
    }

    /// Same as [`verify`](Self::verify) without the liveness stage.
    pub async fn recognize(
        &self,
        image: Vec<u8>,
        gallery: Vec<Template>,
    ) -> Result<VerificationOutcome, EngineError> {
        self.request(|reply| EngineRequest::Recognize {
            image,
            gallery,
            reply,
        })
        .await
    }

    pub async fn liveness(&self, image: Vec<u8>) -> Result<LivenessReport, EngineError> {
        self.request(|reply| EngineRequest::Liveness { image, reply })
            .await?
    }

    /// Extract an enrollment embedding with the configured provider.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        self.request(|reply| EngineRequest::Embed { image, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline, the liveness model and the embedding
/// provider. It provisions the liveness model before serving its first
/// request; requests that arrive meanwhile wait in the queue.
pub fn spawn_engine(
    pipeline: VerificationPipeline,
    mut liveness: LivenessSlot,
    mut embedder: Box<dyn EmbeddingProvider + Send>,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!(embedder = embedder.name(), "engine thread started");
            liveness.provision();

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify {
                        image,
                        gallery,
                        reply,
                    } => {
                        let outcome =
                            pipeline.verify(&image, &mut liveness, embedder.as_mut(), &gallery);
                        let _ = reply.send(outcome);
                    }
                    EngineRequest::Recognize {
                        image,
                        gallery,
                        reply,
                    } => {
                        let outcome = pipeline.recognize(&image, embedder.as_mut(), &gallery);
                        let _ = reply.send(outcome);
                    }
                    EngineRequest::Liveness { image, reply } => {
                        let result = decode(&image).map(|decoded| liveness.check(&decoded));
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { image, reply } => {
                        let result = run_embed(embedder.as_mut(), &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            embedder: embedder.name(),
                            dimension: embedder.dimension(),
                            liveness: liveness.state_label(),
                            liveness_error: liveness.last_error().map(str::to_string),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

fn decode(image: &[u8]) -> Result<image::DynamicImage, EngineError> {
    if image.is_empty() {
        return Err(EngineError::Decode("no image provided".into()));
    }
    image::load_from_memory(image).map_err(|e| EngineError::Decode(e.to_string()))
}

fn run_embed(
    embedder: &mut (dyn EmbeddingProvider + Send),
    bytes: &[u8],
) -> Result<Embedding, EngineError> {
    let image = decode(bytes)?;
    let capture = Capture {
        bytes,
        image: &image,
    };
    let embedding = embedder.extract(&capture)?;
    tracing::info!(
        provider = embedder.name(),
        dimension = embedding.len(),
        "enrollment embedding extracted"
    );
    Ok(embedding)
}

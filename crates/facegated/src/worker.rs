//! Client for the external embedding worker.
//!
//! One process per request: the JSON request goes to stdin, one JSON
//! response comes back on stdout. Every process-level failure (spawn error,
//! non-zero exit, empty or unparsable output, timeout) is an ordinary
//! [`WorkerError`], and so is an unsuccessful reply other than "no face".
//! Worker stderr is logged at debug level only.

use facegate_core::embedding::{EmbedError, EmbeddingProvider};
use facegate_core::protocol::{self, WorkerRequest, WorkerResponse};
use facegate_core::types::{Capture, Embedding, EXTERNAL_DIM};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::Handle;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
    #[error("worker io: {0}")]
    Io(std::io::Error),
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker exited with {0}")]
    Exit(std::process::ExitStatus),
    #[error("worker produced no output")]
    EmptyOutput,
    #[error("worker output is not a valid response: {0}")]
    InvalidOutput(String),
    #[error("request encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("worker rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct WorkerClient {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    retries: u32,
}

impl WorkerClient {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration, retries: u32) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            retries,
        }
    }

    /// Build from a whitespace-separated command line.
    pub fn from_command(command: &str, timeout: Duration, retries: u32) -> Result<Self, WorkerError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(WorkerError::EmptyCommand)?;
        Ok(Self::new(program, parts.collect(), timeout, retries))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Send one request, retrying process-level failures.
    pub async fn call(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let payload = serde_json::to_vec(request)?;
        let mut attempt = 0;
        loop {
            match self.call_once(&payload).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        kind = request.kind(),
                        "worker call failed; retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, payload: &[u8]) -> Result<WorkerResponse, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Io(std::io::Error::other("stdin not captured")))?;
        let write = async move {
            let result = stdin.write_all(payload).await;
            drop(stdin);
            result
        };

        let exchange = async { tokio::join!(write, child.wait_with_output()) };
        let (written, output) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| WorkerError::Timeout(self.timeout))?;
        let output = output.map_err(WorkerError::Io)?;

        if !output.stderr.is_empty() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "worker stderr"
            );
        }
        if let Err(e) = written {
            // a worker that exits without reading stdin is judged by its exit status
            tracing::debug!(error = %e, "writing worker stdin failed");
        }
        if !output.status.success() {
            return Err(WorkerError::Exit(output.status));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(WorkerError::EmptyOutput);
        }
        protocol::parse_response(&output.stdout).map_err(|e| WorkerError::InvalidOutput(e.to_string()))
    }

    /// Extract an embedding for an encoded image.
    ///
    /// `Ok(None)` means the worker answered but found no usable face.
    /// Any other unsuccessful reply is [`WorkerError::Rejected`].
    pub async fn extract(&self, image: &[u8]) -> Result<Option<Vec<f32>>, WorkerError> {
        let response = self.call(&WorkerRequest::extract(image)).await?;
        if response.is_no_face() {
            tracing::debug!(error = ?response.error, "worker found no face");
            return Ok(None);
        }
        match (response.success, response.embedding) {
            (true, Some(values)) => Ok(Some(values)),
            (true, None) => Err(WorkerError::Rejected("success without embedding".to_string())),
            (false, _) => Err(WorkerError::Rejected(
                response.error.unwrap_or_else(|| "no error given".to_string()),
            )),
        }
    }

    /// Send a 1x1 PNG; any parseable response means the worker is usable.
    pub async fn health(&self) -> bool {
        let blank = match blank_png() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode health check image");
                return false;
            }
        };
        let healthy = Self {
            retries: 0,
            ..self.clone()
        };
        match healthy.call(&WorkerRequest::extract(&blank)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "worker health check failed");
                false
            }
        }
    }
}

fn blank_png() -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    image::DynamicImage::new_rgb8(1, 1).write_to(&mut bytes, image::ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Embedding provider that delegates to the worker from the engine thread.
pub struct ExternalEmbedder {
    client: WorkerClient,
    runtime: Handle,
}

impl ExternalEmbedder {
    pub fn new(client: WorkerClient, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

impl EmbeddingProvider for ExternalEmbedder {
    fn name(&self) -> &'static str {
        "external"
    }

    fn dimension(&self) -> usize {
        EXTERNAL_DIM
    }

    fn extract(&mut self, capture: &Capture<'_>) -> Result<Embedding, EmbedError> {
        let values = self
            .runtime
            .block_on(self.client.extract(capture.bytes))
            .map_err(|e| {
                tracing::error!(error = %e, program = self.client.program(), "embedding worker failed");
                EmbedError::Worker(e.to_string())
            })?
            .ok_or(EmbedError::NoFaceDetected)?;

        if values.len() != EXTERNAL_DIM {
            return Err(EmbedError::Dimension {
                expected: EXTERNAL_DIM,
                actual: values.len(),
            });
        }
        Ok(Embedding::new(values))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(body: &str, timeout: Duration) -> WorkerClient {
        WorkerClient::new("sh", vec!["-c".into(), body.into()], timeout, 0)
    }

    fn request() -> WorkerRequest {
        WorkerRequest::extract(b"img")
    }

    #[test]
    fn test_from_command_splits_arguments() {
        let client = WorkerClient::from_command("python3 worker.py --fast", Duration::from_secs(1), 0).unwrap();
        assert_eq!(client.program, "python3");
        assert_eq!(client.args, vec!["worker.py", "--fast"]);
        assert!(matches!(
            WorkerClient::from_command("   ", Duration::from_secs(1), 0),
            Err(WorkerError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_successful_response() {
        let client = script(
            r#"cat >/dev/null; echo '{"success":true,"embedding":[0.6,0.8],"dimension":2}'"#,
            Duration::from_secs(5),
        );
        let response = client.call(&request()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.embedding, Some(vec![0.6, 0.8]));
    }

    #[tokio::test]
    async fn test_worker_sees_request_on_stdin() {
        let client = script(
            r#"grep -q extract_embedding && echo '{"success":true}' || exit 9"#,
            Duration::from_secs(5),
        );
        assert!(client.call(&request()).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let client = script(r#"echo '{"success":true}'; echo oops >&2; exit 3"#, Duration::from_secs(5));
        assert!(matches!(client.call(&request()).await, Err(WorkerError::Exit(_))));
    }

    #[tokio::test]
    async fn test_garbage_output_is_failure() {
        let client = script("cat >/dev/null; echo 'Traceback (most recent call last)'", Duration::from_secs(5));
        assert!(matches!(client.call(&request()).await, Err(WorkerError::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn test_empty_output_is_failure() {
        let client = script("cat >/dev/null", Duration::from_secs(5));
        assert!(matches!(client.call(&request()).await, Err(WorkerError::EmptyOutput)));
    }

    #[tokio::test]
    async fn test_hung_worker_times_out() {
        let client = script("sleep 5", Duration::from_millis(200));
        assert!(matches!(client.call(&request()).await, Err(WorkerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let client = WorkerClient::new("/nonexistent/facegate-worker", vec![], Duration::from_secs(1), 2);
        assert!(matches!(client.call(&request()).await, Err(WorkerError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_no_face_response_means_no_face() {
        let client = script(
            r#"cat >/dev/null; echo '{"success":false,"error":"No face detected in query image"}'"#,
            Duration::from_secs(5),
        );
        assert_eq!(client.extract(b"img").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_other_unsuccessful_response_is_rejected() {
        let client = script(
            r#"cat >/dev/null; echo '{"success":false,"error":"Processing error: models unavailable: w600k_r50.onnx"}'"#,
            Duration::from_secs(5),
        );
        match client.extract(b"img").await {
            Err(WorkerError::Rejected(error)) => assert!(error.contains("models unavailable")),
            other => panic!("expected rejection, got {other:?}"),
        }

        let silent = script(r#"cat >/dev/null; echo '{"success":false}'"#, Duration::from_secs(5));
        assert!(matches!(silent.extract(b"img").await, Err(WorkerError::Rejected(_))));
        let empty = script(r#"cat >/dev/null; echo '{"success":true}'"#, Duration::from_secs(5));
        assert!(matches!(empty.extract(b"img").await, Err(WorkerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_health_accepts_any_parseable_answer() {
        let healthy = script(r#"cat >/dev/null; echo '{"success":false}'"#, Duration::from_secs(5));
        assert!(healthy.health().await);
        let broken = script("exit 1", Duration::from_secs(5));
        assert!(!broken.health().await);
    }

    #[test]
    fn test_external_embedder_checks_dimension() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = script(
            r#"cat >/dev/null; echo '{"success":true,"embedding":[1.0,0.0],"dimension":2}'"#,
            Duration::from_secs(5),
        );
        let mut embedder = ExternalEmbedder::new(client, runtime.handle().clone());
        let image = image::DynamicImage::new_rgb8(2, 2);
        let capture = Capture { bytes: b"img", image: &image };
        assert!(matches!(
            embedder.extract(&capture),
            Err(EmbedError::Dimension { expected: EXTERNAL_DIM, actual: 2 })
        ));
    }

    #[test]
    fn test_external_embedder_maps_worker_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = script("exit 1", Duration::from_secs(5));
        let mut embedder = ExternalEmbedder::new(client, runtime.handle().clone());
        let image = image::DynamicImage::new_rgb8(2, 2);
        let capture = Capture { bytes: b"img", image: &image };
        assert!(matches!(embedder.extract(&capture), Err(EmbedError::Worker(_))));
    }

    #[test]
    fn test_external_embedder_separates_no_face_from_model_errors() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let image = image::DynamicImage::new_rgb8(2, 2);
        let capture = Capture { bytes: b"img", image: &image };

        let broken = script(
            r#"cat >/dev/null; echo '{"success":false,"error":"Processing error: models unavailable: x"}'"#,
            Duration::from_secs(5),
        );
        let mut embedder = ExternalEmbedder::new(broken, runtime.handle().clone());
        match embedder.extract(&capture) {
            Err(EmbedError::Worker(message)) => assert!(message.contains("models unavailable")),
            other => panic!("expected worker failure, got {other:?}"),
        }

        let faceless = script(
            r#"cat >/dev/null; echo '{"success":false,"error":"No face detected or embedding extraction failed"}'"#,
            Duration::from_secs(5),
        );
        let mut embedder = ExternalEmbedder::new(faceless, runtime.handle().clone());
        assert!(matches!(embedder.extract(&capture), Err(EmbedError::NoFaceDetected)));
    }
}

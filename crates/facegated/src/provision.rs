//! Liveness model provisioning: download once, verify, install atomically.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Anything smaller cannot be an ONNX graph.
const MIN_MODEL_BYTES: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("model missing and no download URL configured: {0}")]
    NoSource(String),
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("download failed: HTTP {0}")]
    Status(u16),
    #[error("download did not finish within {0:?}")]
    Timeout(Duration),
    #[error("downloaded file is suspiciously small ({0} bytes)")]
    TooSmall(usize),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client for model downloads with a bounded connect phase.
pub fn download_client() -> Result<reqwest::Client, ProvisionError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

/// Make sure the model file exists at `path`, downloading it when absent.
///
/// The whole download (connect, headers and body) is bounded by `timeout`.
pub async fn ensure_model(
    client: &reqwest::Client,
    url: &str,
    path: &Path,
    sha256: Option<&str>,
    timeout: Duration,
) -> Result<PathBuf, ProvisionError> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "model already present");
        return Ok(path.to_path_buf());
    }
    if url.is_empty() {
        return Err(ProvisionError::NoSource(path.display().to_string()));
    }

    tracing::info!(url, path = %path.display(), ?timeout, "downloading model");
    let bytes = tokio::time::timeout(timeout, fetch(client, url))
        .await
        .map_err(|_| ProvisionError::Timeout(timeout))??;

    install(path, &bytes, sha256)?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "model installed");
    Ok(path.to_path_buf())
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ProvisionError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ProvisionError::Status(response.status().as_u16()));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Verify `bytes` and move them into place through a uniquely named
/// temporary file, so a concurrent or interrupted install never leaves a
/// partial model at `path`.
pub fn install(path: &Path, bytes: &[u8], sha256: Option<&str>) -> Result<(), ProvisionError> {
    if bytes.len() < MIN_MODEL_BYTES {
        return Err(ProvisionError::TooSmall(bytes.len()));
    }
    if let Some(expected) = sha256 {
        let actual = hex_digest(bytes);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(ProvisionError::Checksum {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    let temp = path.with_file_name(format!(".{file_name}.{}.part", uuid::Uuid::new_v4()));

    if let Err(e) = std::fs::write(&temp, bytes).and_then(|()| std::fs::rename(&temp, path)) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

pub fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("facegate-provision-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".part"))
            .collect()
    }

    #[test]
    fn test_install_writes_and_cleans_up() {
        let dir = scratch_dir();
        let path = dir.join("models/liveness.onnx");
        let bytes = vec![7u8; 4096];
        install(&path, &bytes, None).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
        assert!(leftovers(path.parent().unwrap()).is_empty());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_install_rejects_small_payload() {
        let dir = scratch_dir();
        let path = dir.join("liveness.onnx");
        let result = install(&path, b"<html>404</html>", None);
        assert!(matches!(result, Err(ProvisionError::TooSmall(_))));
        assert!(!path.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_install_checks_sha256() {
        let dir = scratch_dir();
        let path = dir.join("liveness.onnx");
        let bytes = vec![1u8; 2048];

        let wrong = install(&path, &bytes, Some("00"));
        assert!(matches!(wrong, Err(ProvisionError::Checksum { .. })));
        assert!(!path.exists());

        let digest = hex_digest(&bytes).to_uppercase();
        install(&path, &bytes, Some(&digest)).unwrap();
        assert!(path.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_hex_digest_known_value() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_existing_model_skips_download() {
        let dir = scratch_dir();
        let path = dir.join("liveness.onnx");
        std::fs::write(&path, b"present").unwrap();
        let client = reqwest::Client::new();
        let resolved = ensure_model(&client, "http://invalid.invalid/model.onnx", &path, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resolved, path);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_model_without_url() {
        let client = reqwest::Client::new();
        let result = ensure_model(
            &client,
            "",
            Path::new("/nonexistent/liveness.onnx"),
            None,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProvisionError::NoSource(_))));
    }

    #[tokio::test]
    async fn test_silent_mirror_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold the connection without ever answering
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let dir = scratch_dir();
        let path = dir.join("liveness.onnx");
        let client = download_client().unwrap();
        let started = std::time::Instant::now();
        let result = ensure_model(
            &client,
            &format!("http://{addr}/model.onnx"),
            &path,
            None,
            Duration::from_millis(300),
        )
        .await;

        assert!(matches!(result, Err(ProvisionError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!path.exists());
        server.abort();
        std::fs::remove_dir_all(dir).unwrap();
    }
}

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod detector;
mod recognizer;
mod service;

use service::{OnnxEmbedder, Service};

/// `FACEGATE_MODEL_DIR`, else `$XDG_DATA_HOME/facegate/models`.
fn model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEGATE_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}

fn main() -> Result<()> {
    // stdout carries exactly one JSON response
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read request from stdin")?;

    let dir = model_dir();
    tracing::debug!(models = %dir.display(), bytes = input.len(), "request received");

    let response = Service::new(OnnxEmbedder::new(dir)).handle_raw(&input);
    if let Some(error) = &response.error {
        tracing::warn!(error, "request unsuccessful");
    }

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &response).context("failed to encode response")?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

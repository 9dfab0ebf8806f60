use anyhow::{Context, Result};
use facegate_core::{EmbeddingProvider, HeuristicEmbedder, VerificationPipeline};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod liveness_slot;
mod provision;
mod store;
mod worker;

use config::{BusKind, Config, EmbedderKind};
use liveness_slot::{LivenessSlot, ModelSource};
use worker::{ExternalEmbedder, WorkerClient};

const BUS_NAME: &str = "org.facegate.Checkpoint1";
const OBJECT_PATH: &str = "/org/facegate/Checkpoint1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env();
    let schedule = config
        .shift_schedule()
        .context("failed to load shift schedule")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        embedder = config.embedder.as_str(),
        utc_offset = %config.utc_offset,
        shifts = schedule.windows.len(),
        "configuration loaded"
    );

    let store = store::Store::open(&config.db_path)
        .await
        .context("failed to open attendance database")?;

    let runtime = tokio::runtime::Handle::current();
    let worker = match config.embedder {
        EmbedderKind::External => Some(
            WorkerClient::from_command(
                &config.worker_command,
                config.worker_timeout(),
                config.worker_retries,
            )
            .context("invalid FACEGATE_WORKER_COMMAND")?,
        ),
        EmbedderKind::Heuristic => None,
    };
    let embedder: Box<dyn EmbeddingProvider + Send> = match &worker {
        Some(client) => Box::new(ExternalEmbedder::new(client.clone(), runtime.clone())),
        None => Box::new(HeuristicEmbedder::default()),
    };

    let liveness = LivenessSlot::new(
        ModelSource {
            url: config.liveness_model_url.clone(),
            path: config.liveness_model_path(),
            sha256: config.liveness_model_sha256.clone(),
            download_timeout: config.model_download_timeout(),
        },
        config.liveness_threshold,
        runtime,
    );

    let engine_timeout = config.engine_timeout();
    tracing::info!(?engine_timeout, worker_budget = ?config.worker_budget(), "engine deadline");
    let engine = engine::spawn_engine(
        VerificationPipeline::new(config.pipeline()),
        liveness,
        embedder,
        engine_timeout,
    )?;

    let service = dbus_interface::FacegateService {
        engine,
        store,
        schedule,
        offset: config.utc_offset,
        embedder: config.embedder,
        worker,
    };

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}

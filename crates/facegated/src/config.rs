use chrono::{FixedOffset, Offset};
use facegate_core::matcher::{MatchPolicy, DEFAULT_MIN_CONFIDENCE_GAP, DEFAULT_SIMILARITY_THRESHOLD};
use facegate_core::pipeline::PipelineConfig;
use facegate_core::quality::DEFAULT_MIN_QUALITY;
use facegate_core::liveness::DEFAULT_LIVENESS_THRESHOLD;
use facegate_core::ShiftSchedule;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LIVENESS_MODEL_URL: &str =
    "https://github.com/hairymax/Face-AntiSpoofing/raw/main/saved_models/AntiSpoofing_bin_128.onnx";
const LIVENESS_MODEL_FILE: &str = "AntiSpoofing_bin_128.onnx";
/// Headroom between the worst-case worker call and the engine deadline.
const ENGINE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Which embedding provider the engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderKind {
    Heuristic,
    External,
}

impl EmbedderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedderKind::Heuristic => "heuristic",
            EmbedderKind::External => "external",
        }
    }
}

/// Which D-Bus bus the service is exported on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Download source for the liveness model; empty disables downloading.
    pub liveness_model_url: String,
    /// Optional hex SHA-256 the downloaded liveness model must match.
    pub liveness_model_sha256: Option<String>,
    /// Bound on one liveness model download, in seconds.
    pub model_download_timeout_secs: u64,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub embedder: EmbedderKind,
    /// Worker program and arguments, split on whitespace.
    pub worker_command: String,
    pub worker_timeout_secs: u64,
    /// Extra attempts after a failed worker call.
    pub worker_retries: u32,
    pub similarity_threshold: f32,
    pub min_confidence_gap: f32,
    pub quality_min_score: f32,
    pub liveness_threshold: f32,
    /// Lower bound on one engine request, in seconds. See [`Config::engine_timeout`].
    pub verify_timeout_secs: u64,
    /// Site offset used for every local-day and shift computation.
    pub utc_offset: FixedOffset,
    /// Optional TOML file overriding the default shift windows.
    pub shifts_file: Option<PathBuf>,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let embedder = match std::env::var("FACEGATE_EMBEDDER").as_deref() {
            Ok("heuristic") => EmbedderKind::Heuristic,
            Ok("external") | Err(_) => EmbedderKind::External,
            Ok(other) => {
                tracing::warn!(value = other, "unknown FACEGATE_EMBEDDER; using external");
                EmbedderKind::External
            }
        };

        let utc_offset = match std::env::var("FACEGATE_UTC_OFFSET") {
            Ok(value) => parse_utc_offset(&value).unwrap_or_else(|| {
                tracing::warn!(value, "invalid FACEGATE_UTC_OFFSET; using system local offset");
                local_offset()
            }),
            Err(_) => local_offset(),
        };

        let bus = match std::env::var("FACEGATE_BUS").as_deref() {
            Ok("session") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            model_dir,
            liveness_model_url: std::env::var("FACEGATE_LIVENESS_MODEL_URL")
                .unwrap_or_else(|_| DEFAULT_LIVENESS_MODEL_URL.to_string()),
            liveness_model_sha256: std::env::var("FACEGATE_LIVENESS_MODEL_SHA256")
                .ok()
                .filter(|v| !v.is_empty()),
            model_download_timeout_secs: env_u64("FACEGATE_MODEL_DOWNLOAD_TIMEOUT_SECS", 60),
            db_path,
            embedder,
            worker_command: std::env::var("FACEGATE_WORKER_COMMAND")
                .unwrap_or_else(|_| "facegate-worker".to_string()),
            worker_timeout_secs: env_u64("FACEGATE_WORKER_TIMEOUT_SECS", 30),
            worker_retries: env_u64("FACEGATE_WORKER_RETRIES", 1) as u32,
            similarity_threshold: env_f32("FACEGATE_SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD),
            min_confidence_gap: env_f32("FACEGATE_MIN_CONFIDENCE_GAP", DEFAULT_MIN_CONFIDENCE_GAP),
            quality_min_score: env_f32("FACEGATE_QUALITY_MIN_SCORE", DEFAULT_MIN_QUALITY),
            liveness_threshold: env_f32("FACEGATE_LIVENESS_THRESHOLD", DEFAULT_LIVENESS_THRESHOLD),
            verify_timeout_secs: env_u64("FACEGATE_VERIFY_TIMEOUT_SECS", 20),
            utc_offset,
            shifts_file: std::env::var("FACEGATE_SHIFTS_FILE").ok().map(PathBuf::from),
            bus,
        }
    }

    /// Where the liveness model lives (downloaded on first start if absent).
    pub fn liveness_model_path(&self) -> PathBuf {
        self.model_dir.join(LIVENESS_MODEL_FILE)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            min_quality: self.quality_min_score,
            policy: MatchPolicy {
                similarity_threshold: self.similarity_threshold,
                min_confidence_gap: self.min_confidence_gap,
            },
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn model_download_timeout(&self) -> Duration {
        Duration::from_secs(self.model_download_timeout_secs)
    }

    /// Worst case for one external embedding: every attempt runs to its timeout.
    pub fn worker_budget(&self) -> Duration {
        self.worker_timeout() * self.worker_retries.saturating_add(1)
    }

    /// Deadline for one engine request.
    ///
    /// With the external embedder this always exceeds [`worker_budget`](Self::worker_budget),
    /// so a hung worker is reported as a worker failure by the engine rather
    /// than as an engine timeout.
    pub fn engine_timeout(&self) -> Duration {
        let floor = Duration::from_secs(self.verify_timeout_secs);
        match self.embedder {
            EmbedderKind::External => floor.max(self.worker_budget() + ENGINE_TIMEOUT_MARGIN),
            EmbedderKind::Heuristic => floor,
        }
    }

    /// Shift windows: the TOML file when configured, the defaults otherwise.
    pub fn shift_schedule(&self) -> anyhow::Result<ShiftSchedule> {
        match &self.shifts_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(ShiftSchedule::from_toml(&text)?)
            }
            None => Ok(ShiftSchedule::default()),
        }
    }
}

fn local_offset() -> FixedOffset {
    chrono::Local::now().offset().fix()
}

/// Parse `±HH:MM` (or `Z`) into a fixed offset.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => (1, value),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

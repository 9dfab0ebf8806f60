//! facegate-core — checkpoint verification and attendance decisions.
//!
//! Quality gate, ONNX liveness classifier, heuristic face descriptor,
//! template matching and the shift decision engine. Synchronous; the daemon
//! owns threading and I/O.

pub mod descriptor;
pub mod embedding;
pub mod liveness;
pub mod localize;
pub mod matcher;
pub mod pipeline;
pub mod protocol;
pub mod quality;
pub mod shift;
pub mod types;

pub use embedding::{EmbedError, EmbeddingProvider, HeuristicEmbedder};
pub use liveness::{LivenessCheck, LivenessDetector, LivenessReport};
pub use matcher::{MatchPolicy, TemplateMatcher};
pub use pipeline::{PipelineConfig, VerificationOutcome, VerificationPipeline};
pub use shift::{AttendanceStatus, CheckType, Decision, ShiftSchedule};
pub use types::{Capture, Embedding, Template};

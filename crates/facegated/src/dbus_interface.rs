use crate::config::EmbedderKind;
use crate::engine::{EngineError, EngineHandle};
use crate::store::{AttendanceOutcome, Method, Store, StoreError};
use crate::worker::WorkerClient;
use chrono::{FixedOffset, Utc};
use facegate_core::liveness::LivenessResponse;
use facegate_core::pipeline::VerificationResponse;
use facegate_core::{EmbedError, ShiftSchedule};
use serde::Serialize;
use zbus::{fdo, interface};

/// D-Bus interface for the facegate checkpoint daemon.
///
/// Bus name: org.facegate.Checkpoint1
/// Object path: /org/facegate/Checkpoint1
///
/// Every method answers with a JSON document. Business outcomes (not
/// recognized, shift already completed) are successful calls; engine and
/// store failures become `org.freedesktop.DBus.Error.Failed`.
pub struct FacegateService {
    pub engine: EngineHandle,
    pub store: Store,
    pub schedule: ShiftSchedule,
    pub offset: FixedOffset,
    pub embedder: EmbedderKind,
    /// Present when the external embedder is configured; checked by `Status`.
    pub worker: Option<WorkerClient>,
}

#[derive(Serialize)]
struct CheckInResponse {
    #[serde(flatten)]
    verification: VerificationResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    attendance: Option<AttendanceOutcome>,
}

#[derive(Serialize)]
struct AttendanceResponse {
    success: bool,
    #[serde(flatten)]
    outcome: AttendanceOutcome,
}

impl From<AttendanceOutcome> for AttendanceResponse {
    fn from(outcome: AttendanceOutcome) -> Self {
        Self {
            success: outcome.event.is_some(),
            outcome,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding response: {e}")))
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Decode(msg) => fdo::Error::InvalidArgs(format!("image could not be decoded: {msg}")),
        EngineError::Embed(EmbedError::NoFaceDetected) => {
            fdo::Error::Failed("no face detected".into())
        }
        EngineError::Embed(EmbedError::Worker(_)) => {
            fdo::Error::Failed("embedding service unavailable".into())
        }
        other => {
            tracing::error!(error = %other, "engine request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn store_error(e: StoreError) -> fdo::Error {
    match e {
        StoreError::NameTaken(_)
        | StoreError::QrTaken(_)
        | StoreError::UserNotFound(_)
        | StoreError::EmptyUpdate => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "store request failed");
            fdo::Error::Failed("database error".into())
        }
    }
}

fn parse_method(method: &str) -> fdo::Result<Method> {
    Method::parse(method).ok_or_else(|| {
        fdo::Error::InvalidArgs(format!(
            "unknown method {method:?}; expected FaceID, QR or FaceID-WebRTC"
        ))
    })
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl FacegateService {
    async fn attend(&self, user_id: i64, method: Method) -> fdo::Result<AttendanceOutcome> {
        self.store
            .record_attendance(self.schedule.clone(), self.offset, user_id, method, Utc::now())
            .await
            .map_err(store_error)
    }
}

#[interface(name = "org.facegate.Checkpoint1")]
impl FacegateService {
    /// Quality, liveness and identification against the active gallery.
    async fn verify(&self, image: Vec<u8>) -> fdo::Result<String> {
        let gallery = self.store.templates().await.map_err(store_error)?;
        let outcome = self.engine.verify(image, gallery).await.map_err(engine_error)?;
        to_json(&outcome.response())
    }

    async fn check_liveness(&self, image: Vec<u8>) -> fdo::Result<String> {
        let report = self.engine.liveness(image).await.map_err(engine_error)?;
        to_json(&LivenessResponse::from(&report))
    }

    /// Identification without the liveness stage.
    async fn recognize(&self, image: Vec<u8>) -> fdo::Result<String> {
        let gallery = self.store.templates().await.map_err(store_error)?;
        let outcome = self.engine.recognize(image, gallery).await.map_err(engine_error)?;
        to_json(&outcome.response())
    }

    /// Verify a capture and record attendance for whoever it identifies.
    async fn check_in(&self, image: Vec<u8>, method: &str) -> fdo::Result<String> {
        let method = parse_method(method)?;
        let gallery = self.store.templates().await.map_err(store_error)?;
        let outcome = self.engine.verify(image, gallery).await.map_err(engine_error)?;

        let attendance = match outcome.recognized() {
            Some(candidate) => Some(self.attend(candidate.user_id, method).await?),
            None => None,
        };
        to_json(&CheckInResponse {
            verification: outcome.response(),
            attendance,
        })
    }

    async fn record_attendance(&self, user_id: i64, method: &str) -> fdo::Result<String> {
        let method = parse_method(method)?;
        let outcome = self.attend(user_id, method).await?;
        to_json(&AttendanceResponse::from(outcome))
    }

    /// Attendance via an already-decoded QR token.
    async fn check_in_qr(&self, token: &str) -> fdo::Result<String> {
        let user = self
            .store
            .find_by_qr(token.trim().to_string())
            .await
            .map_err(store_error)?;
        let Some(user) = user else {
            tracing::info!("unknown QR token presented");
            return to_json(&serde_json::json!({
                "success": false,
                "error": "unknown QR token",
            }));
        };
        let outcome = self.attend(user.id, Method::Qr).await?;
        to_json(&AttendanceResponse::from(outcome))
    }

    async fn enroll(&self, name: &str, image: Vec<u8>) -> fdo::Result<String> {
        let name = non_empty(name).ok_or_else(|| fdo::Error::InvalidArgs("name is required".into()))?;
        let embedding = self.engine.embed(image).await.map_err(engine_error)?;
        let now = Utc::now();
        let qr_code = format!("QR-{name}-{}", now.timestamp_millis());
        let id = self
            .store
            .insert_user(name.clone(), embedding, qr_code.clone(), now)
            .await
            .map_err(store_error)?;
        tracing::info!(id, name, embedder = self.embedder.as_str(), "user enrolled");
        to_json(&serde_json::json!({
            "success": true,
            "id": id,
            "name": name,
            "qr_code": qr_code,
        }))
    }

    /// Replace the stored embedding of an existing user.
    async fn re_enroll(&self, user_id: i64, image: Vec<u8>) -> fdo::Result<String> {
        let embedding = self.engine.embed(image).await.map_err(engine_error)?;
        self.store
            .update_embedding(user_id, embedding)
            .await
            .map_err(store_error)?;
        tracing::info!(user_id, "user re-enrolled");
        to_json(&serde_json::json!({ "success": true, "id": user_id }))
    }

    /// Empty strings leave the field unchanged.
    async fn update_user(&self, user_id: i64, name: &str, qr_code: &str) -> fdo::Result<String> {
        self.store
            .update_user(user_id, non_empty(name), non_empty(qr_code))
            .await
            .map_err(store_error)?;
        to_json(&serde_json::json!({ "success": true, "id": user_id }))
    }

    async fn list_users(&self) -> fdo::Result<String> {
        let users = self.store.list_users().await.map_err(store_error)?;
        to_json(&users)
    }

    async fn remove_user(&self, user_id: i64) -> fdo::Result<String> {
        let removed = self.store.delete_user(user_id).await.map_err(store_error)?;
        tracing::info!(user_id, removed, "remove_user");
        to_json(&serde_json::json!({ "removed": removed }))
    }

    async fn deactivate_user(&self, user_id: i64) -> fdo::Result<String> {
        let deactivated = self.store.deactivate_user(user_id).await.map_err(store_error)?;
        tracing::info!(user_id, deactivated, "deactivate_user");
        to_json(&serde_json::json!({ "deactivated": deactivated }))
    }

    /// Most recent attendance rows; 0 means the default limit.
    async fn records(&self, limit: u32) -> fdo::Result<String> {
        let rows = self.store.records(Some(limit)).await.map_err(store_error)?;
        to_json(&rows)
    }

    async fn stats(&self) -> fdo::Result<String> {
        let stats = self
            .store
            .daily_stats(&self.offset, Utc::now())
            .await
            .map_err(store_error)?;
        to_json(&stats)
    }

    async fn status(&self) -> fdo::Result<String> {
        let engine = self.engine.status().await.map_err(engine_error)?;
        let worker = match &self.worker {
            Some(client) => Some(client.health().await),
            None => None,
        };
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "embedder": engine.embedder,
            "dimension": engine.dimension,
            "liveness_model": engine.liveness,
            "liveness_error": engine.liveness_error,
            "worker_available": worker,
            "utc_offset": self.offset.to_string(),
        }))
    }
}

//! SQLite gallery and attendance store.
//!
//! Queries are plain functions over a `rusqlite::Connection`; [`Store`] runs
//! them on the `tokio-rusqlite` background connection so D-Bus handlers can
//! await them.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use facegate_core::shift::{self, AttendanceStatus, CheckType, Decision, RecordedEvent, ShiftSchedule};
use facegate_core::types::{Embedding, Template};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        embedding TEXT NOT NULL,
        qr_code TEXT UNIQUE NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        method TEXT NOT NULL,
        check_type TEXT NOT NULL,
        status TEXT NOT NULL,
        shift_id TEXT,
        local_day TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_attendance_user_id ON attendance(user_id);
    CREATE INDEX IF NOT EXISTS idx_attendance_timestamp ON attendance(timestamp);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_shift_event
        ON attendance(user_id, shift_id, local_day, check_type)
        WHERE shift_id IS NOT NULL;
";

const DEFAULT_RECORDS_LIMIT: u32 = 100;
const RECENT_ACTIVITY: u32 = 5;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored embedding is corrupt: {0}")]
    Embedding(#[from] serde_json::Error),
    #[error("stored timestamp is corrupt: {0}")]
    Timestamp(String),
    #[error("name already enrolled: {0}")]
    NameTaken(String),
    #[error("QR token already assigned: {0}")]
    QrTaken(String),
    #[error("user not found: {0}")]
    UserNotFound(i64),
    #[error("nothing to update")]
    EmptyUpdate,
    #[error("database connection: {0}")]
    Connection(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// How an attendance event was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    #[serde(rename = "FaceID")]
    FaceId,
    #[serde(rename = "QR")]
    Qr,
    #[serde(rename = "FaceID-WebRTC")]
    FaceIdWebRtc,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::FaceId => "FaceID",
            Method::Qr => "QR",
            Method::FaceIdWebRtc => "FaceID-WebRTC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FaceID" => Some(Method::FaceId),
            "QR" => Some(Method::Qr),
            "FaceID-WebRTC" => Some(Method::FaceIdWebRtc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub qr_code: String,
    pub active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub method: String,
    pub check_type: String,
    pub status: String,
    pub shift_id: Option<String>,
    pub timestamp: String,
}

/// Result of one attendance attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceOutcome {
    pub user_id: i64,
    pub user_name: String,
    #[serde(flatten)]
    pub decision: Decision,
    /// The row written; `None` when the shift was already complete.
    pub event: Option<AttendanceRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub total_employees: i64,
    pub check_ins_today: i64,
    pub late_today: i64,
    pub on_time_today: i64,
    pub recent_activity: Vec<AttendanceRecord>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp(format!("{text}: {e}")))
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

/// Map a users-table uniqueness failure onto the column that caused it.
fn user_conflict(e: rusqlite::Error, name: &str, qr_code: &str) -> StoreError {
    if is_constraint(&e) {
        let message = e.to_string();
        if message.contains("users.qr_code") {
            return StoreError::QrTaken(qr_code.to_string());
        }
        if message.contains("users.name") {
            return StoreError::NameTaken(name.to_string());
        }
    }
    StoreError::Sqlite(e)
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn insert_user(
    conn: &Connection,
    name: &str,
    embedding: &Embedding,
    qr_code: &str,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO users (name, embedding, qr_code, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![name, embedding.to_json(), qr_code, timestamp(now)],
    )
    .map_err(|e| user_conflict(e, name, qr_code))?;
    Ok(conn.last_insert_rowid())
}

pub fn update_embedding(conn: &Connection, user_id: i64, embedding: &Embedding) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE users SET embedding = ?1 WHERE id = ?2",
        params![embedding.to_json(), user_id],
    )?;
    if changed == 0 {
        return Err(StoreError::UserNotFound(user_id));
    }
    Ok(())
}

pub fn update_user(
    conn: &Connection,
    user_id: i64,
    name: Option<&str>,
    qr_code: Option<&str>,
) -> Result<(), StoreError> {
    if name.is_none() && qr_code.is_none() {
        return Err(StoreError::EmptyUpdate);
    }
    let changed = conn
        .execute(
            "UPDATE users SET name = COALESCE(?1, name), qr_code = COALESCE(?2, qr_code) WHERE id = ?3",
            params![name, qr_code, user_id],
        )
        .map_err(|e| user_conflict(e, name.unwrap_or_default(), qr_code.unwrap_or_default()))?;
    if changed == 0 {
        return Err(StoreError::UserNotFound(user_id));
    }
    Ok(())
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        qr_code: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
    })
}

pub fn list_users(conn: &Connection) -> Result<Vec<UserRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, qr_code, active, created_at FROM users ORDER BY id ASC",
    )?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn user(conn: &Connection, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
    let user = conn
        .query_row(
            "SELECT id, name, qr_code, active, created_at FROM users WHERE id = ?1",
            [user_id],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

/// Active users only.
pub fn find_by_qr(conn: &Connection, token: &str) -> Result<Option<UserRecord>, StoreError> {
    let user = conn
        .query_row(
            "SELECT id, name, qr_code, active, created_at FROM users WHERE qr_code = ?1 AND active = 1",
            [token],
            user_from_row,
        )
        .optional()?;
    Ok(user)
}

/// Gallery of active users.
pub fn templates(conn: &Connection) -> Result<Vec<Template>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, name, embedding FROM users WHERE active = 1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(user_id, name, json)| {
            Ok(Template {
                user_id,
                name,
                embedding: Embedding::from_json(&json)?,
            })
        })
        .collect()
}

/// Hard delete; attendance rows go with the user.
pub fn delete_user(conn: &Connection, user_id: i64) -> Result<bool, StoreError> {
    Ok(conn.execute("DELETE FROM users WHERE id = ?1", [user_id])? > 0)
}

/// Soft delete; history is kept.
pub fn deactivate_user(conn: &Connection, user_id: i64) -> Result<bool, StoreError> {
    Ok(conn.execute("UPDATE users SET active = 0 WHERE id = ?1 AND active = 1", [user_id])? > 0)
}

pub fn events_between(
    conn: &Connection,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<RecordedEvent>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT check_type, timestamp FROM attendance
         WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
         ORDER BY timestamp ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id, timestamp(start), timestamp(end)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut events = Vec::with_capacity(rows.len());
    for (check_type, ts) in rows {
        let Some(check_type) = CheckType::parse(&check_type) else {
            tracing::warn!(user_id, check_type, "skipping attendance row with unknown check type");
            continue;
        };
        events.push(RecordedEvent {
            check_type,
            timestamp: parse_timestamp(&ts)?,
        });
    }
    Ok(events)
}

fn attendance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_name: row.get(2)?,
        method: row.get(3)?,
        check_type: row.get(4)?,
        status: row.get(5)?,
        shift_id: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

const ATTENDANCE_COLUMNS: &str =
    "a.id, a.user_id, u.name, a.method, a.check_type, a.status, a.shift_id, a.timestamp";

/// Decide and append an attendance event in one IMMEDIATE transaction.
///
/// The unique index on shift events turns a concurrent duplicate into the
/// "shift completed" outcome instead of a second row.
pub fn record_attendance<Tz: TimeZone>(
    conn: &mut Connection,
    schedule: &ShiftSchedule,
    tz: &Tz,
    user_id: i64,
    method: Method,
    now: DateTime<Utc>,
) -> Result<AttendanceOutcome, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let user = user(&tx, user_id)?
        .filter(|u| u.active)
        .ok_or(StoreError::UserNotFound(user_id))?;

    let day = shift::local_day(tz, now);
    let (start, end) = shift::local_day_bounds(tz, day);
    let events = events_between(&tx, user_id, start, end)?;
    let decision = shift::decide(schedule, tz, now, &events);

    let Decision::Record {
        check_type,
        status,
        shift: shift_id,
    } = &decision
    else {
        tracing::info!(user_id, shift = ?decision.shift(), "shift already completed");
        return Ok(AttendanceOutcome {
            user_id,
            user_name: user.name,
            decision,
            event: None,
        });
    };

    let inserted = tx.execute(
        "INSERT INTO attendance (user_id, method, check_type, status, shift_id, local_day, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user_id,
            method.as_str(),
            check_type.as_str(),
            status.as_str(),
            shift_id,
            day.to_string(),
            timestamp(now),
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint(&e) => {
            let shift = shift_id.clone().unwrap_or_default();
            tracing::info!(user_id, shift, "duplicate shift event refused");
            return Ok(AttendanceOutcome {
                user_id,
                user_name: user.name,
                decision: Decision::ShiftCompleted { shift },
                event: None,
            });
        }
        Err(e) => return Err(e.into()),
    }

    let id = tx.last_insert_rowid();
    let event = tx.query_row(
        &format!("SELECT {ATTENDANCE_COLUMNS} FROM attendance a JOIN users u ON u.id = a.user_id WHERE a.id = ?1"),
        [id],
        attendance_from_row,
    )?;
    tx.commit()?;

    tracing::info!(
        user_id,
        check_type = %check_type,
        status = %status,
        method = method.as_str(),
        "attendance recorded"
    );
    Ok(AttendanceOutcome {
        user_id,
        user_name: user.name,
        decision,
        event: Some(event),
    })
}

/// Most recent attendance rows first.
pub fn records(conn: &Connection, limit: u32) -> Result<Vec<AttendanceRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTENDANCE_COLUMNS} FROM attendance a JOIN users u ON u.id = a.user_id
         ORDER BY a.timestamp DESC, a.id DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map([limit], attendance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Most recent rows first, restricted to `[start, end)`.
pub fn records_between(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<AttendanceRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTENDANCE_COLUMNS} FROM attendance a JOIN users u ON u.id = a.user_id
         WHERE a.timestamp >= ?1 AND a.timestamp < ?2
         ORDER BY a.timestamp DESC, a.id DESC LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![timestamp(start), timestamp(end), limit], attendance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts and latest events for the local day `[start, end)`.
pub fn daily_stats(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<DailyStats, StoreError> {
    let total_employees: i64 =
        conn.query_row("SELECT COUNT(*) FROM users WHERE active = 1", [], |row| row.get(0))?;

    let count_today = |extra: &str| -> Result<i64, StoreError> {
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM attendance
                 WHERE check_type = 'check_in' AND timestamp >= ?1 AND timestamp < ?2 {extra}"
            ),
            params![timestamp(start), timestamp(end)],
            |row| row.get(0),
        )?)
    };

    Ok(DailyStats {
        total_employees,
        check_ins_today: count_today("")?,
        late_today: count_today(&format!("AND status = '{}'", AttendanceStatus::Late.as_str()))?,
        on_time_today: count_today(&format!("AND status = '{}'", AttendanceStatus::OnTime.as_str()))?,
        recent_activity: records_between(conn, start, end, RECENT_ACTIVITY)?,
    })
}

/// Async facade over a single background SQLite connection.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        let store = Self { conn };
        store.run(|conn| init_schema(conn)).await?;
        Ok(store)
    }

    async fn run<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| f(conn).map_err(|e| tokio_rusqlite::Error::Other(Box::new(e))))
            .await
            .map_err(|e| match e {
                tokio_rusqlite::Error::Other(inner) => match inner.downcast::<StoreError>() {
                    Ok(store_error) => *store_error,
                    Err(other) => StoreError::Connection(other.to_string()),
                },
                other => StoreError::Connection(other.to_string()),
            })
    }

    pub async fn insert_user(
        &self,
        name: String,
        embedding: Embedding,
        qr_code: String,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.run(move |conn| insert_user(conn, &name, &embedding, &qr_code, now))
            .await
    }

    pub async fn update_embedding(&self, user_id: i64, embedding: Embedding) -> Result<(), StoreError> {
        self.run(move |conn| update_embedding(conn, user_id, &embedding)).await
    }

    pub async fn update_user(
        &self,
        user_id: i64,
        name: Option<String>,
        qr_code: Option<String>,
    ) -> Result<(), StoreError> {
        self.run(move |conn| update_user(conn, user_id, name.as_deref(), qr_code.as_deref()))
            .await
    }

    pub async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.run(|conn| list_users(conn)).await
    }

    pub async fn find_by_qr(&self, token: String) -> Result<Option<UserRecord>, StoreError> {
        self.run(move |conn| find_by_qr(conn, &token)).await
    }

    pub async fn templates(&self) -> Result<Vec<Template>, StoreError> {
        self.run(|conn| templates(conn)).await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<bool, StoreError> {
        self.run(move |conn| delete_user(conn, user_id)).await
    }

    pub async fn deactivate_user(&self, user_id: i64) -> Result<bool, StoreError> {
        self.run(move |conn| deactivate_user(conn, user_id)).await
    }

    pub async fn record_attendance<Tz>(
        &self,
        schedule: ShiftSchedule,
        tz: Tz,
        user_id: i64,
        method: Method,
        now: DateTime<Utc>,
    ) -> Result<AttendanceOutcome, StoreError>
    where
        Tz: TimeZone + Send + 'static,
    {
        self.run(move |conn| record_attendance(conn, &schedule, &tz, user_id, method, now))
            .await
    }

    pub async fn records(&self, limit: Option<u32>) -> Result<Vec<AttendanceRecord>, StoreError> {
        let limit = limit.filter(|&l| l > 0).unwrap_or(DEFAULT_RECORDS_LIMIT);
        self.run(move |conn| records(conn, limit)).await
    }

    pub async fn daily_stats<Tz: TimeZone>(&self, tz: &Tz, now: DateTime<Utc>) -> Result<DailyStats, StoreError> {
        let (start, end) = shift::local_day_bounds(tz, shift::local_day(tz, now));
        self.run(move |conn| daily_stats(conn, start, end)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    /// UTC instant for a local wall-clock time in `tz()`.
    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        tz().with_ymd_and_hms(2024, 3, day, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn enroll(conn: &Connection, name: &str) -> i64 {
        insert_user(conn, name, &emb(&[0.1, 0.2]), &format!("QR-{name}-1"), at(1, 9, 0)).unwrap()
    }

    fn attend(conn: &mut Connection, user_id: i64, now: DateTime<Utc>) -> AttendanceOutcome {
        record_attendance(conn, &ShiftSchedule::default(), &tz(), user_id, Method::FaceId, now).unwrap()
    }

    fn attendance_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_duplicate_name_is_distinct_error() {
        let conn = conn();
        enroll(&conn, "alice");
        let err = insert_user(&conn, "alice", &emb(&[1.0]), "QR-other", at(1, 9, 0)).unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(name) if name == "alice"));
    }

    #[test]
    fn test_duplicate_qr_is_distinct_error() {
        let conn = conn();
        enroll(&conn, "alice");
        let err = insert_user(&conn, "bob", &emb(&[1.0]), "QR-alice-1", at(1, 9, 0)).unwrap_err();
        assert!(matches!(err, StoreError::QrTaken(_)));
    }

    #[test]
    fn test_embedding_roundtrip_is_lossless() {
        let conn = conn();
        let original = emb(&[0.1, -2.5e-8, 1.0 / 3.0, f32::MAX]);
        insert_user(&conn, "carol", &original, "QR-carol-1", at(1, 9, 0)).unwrap();
        let gallery = templates(&conn).unwrap();
        assert_eq!(gallery.len(), 1);
        for (a, b) in original.values.iter().zip(gallery[0].embedding.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_update_user() {
        let conn = conn();
        let alice = enroll(&conn, "alice");
        enroll(&conn, "bob");

        update_user(&conn, alice, Some("alicia"), None).unwrap();
        assert_eq!(user(&conn, alice).unwrap().unwrap().name, "alicia");

        assert!(matches!(
            update_user(&conn, alice, Some("bob"), None),
            Err(StoreError::NameTaken(_))
        ));
        assert!(matches!(update_user(&conn, alice, None, None), Err(StoreError::EmptyUpdate)));
        assert!(matches!(
            update_user(&conn, 999, Some("x"), None),
            Err(StoreError::UserNotFound(999))
        ));
    }

    #[test]
    fn test_re_enroll_replaces_embedding() {
        let conn = conn();
        let alice = enroll(&conn, "alice");
        update_embedding(&conn, alice, &emb(&[9.0, 9.0])).unwrap();
        assert_eq!(templates(&conn).unwrap()[0].embedding, emb(&[9.0, 9.0]));
        assert!(matches!(
            update_embedding(&conn, 42, &emb(&[1.0])),
            Err(StoreError::UserNotFound(42))
        ));
    }

    #[test]
    fn test_full_shift_then_refusal() {
        let mut conn = conn();
        let alice = enroll(&conn, "alice");

        let first = attend(&mut conn, alice, at(11, 8, 0));
        assert_eq!(
            first.decision,
            Decision::Record {
                check_type: CheckType::CheckIn,
                status: AttendanceStatus::OnTime,
                shift: Some("A".into()),
            }
        );
        let event = first.event.unwrap();
        assert_eq!(event.method, "FaceID");
        assert_eq!(event.user_name, "alice");
        assert_eq!(event.timestamp, "2024-03-11T01:00:00.000Z");

        let second = attend(&mut conn, alice, at(11, 11, 0));
        assert_eq!(
            second.decision,
            Decision::Record {
                check_type: CheckType::CheckOut,
                status: AttendanceStatus::EarlyLeave,
                shift: Some("A".into()),
            }
        );

        let third = attend(&mut conn, alice, at(11, 12, 0));
        assert_eq!(third.decision, Decision::ShiftCompleted { shift: "A".into() });
        assert!(third.event.is_none());
        assert_eq!(attendance_count(&conn), 2);

        // afternoon shift is independent
        let afternoon = attend(&mut conn, alice, at(11, 14, 5));
        assert!(matches!(
            afternoon.decision,
            Decision::Record {
                check_type: CheckType::CheckIn,
                status: AttendanceStatus::Late,
                ..
            }
        ));
    }

    #[test]
    fn test_next_day_starts_fresh() {
        let mut conn = conn();
        let alice = enroll(&conn, "alice");
        attend(&mut conn, alice, at(11, 8, 0));
        attend(&mut conn, alice, at(11, 12, 0));
        let next = attend(&mut conn, alice, at(12, 8, 0));
        assert!(matches!(
            next.decision,
            Decision::Record {
                check_type: CheckType::CheckIn,
                ..
            }
        ));
    }

    #[test]
    fn test_unique_index_blocks_duplicate_shift_event() {
        let conn = conn();
        let alice = enroll(&conn, "alice");
        let insert = |ts: &str| {
            conn.execute(
                "INSERT INTO attendance (user_id, method, check_type, status, shift_id, local_day, timestamp)
                 VALUES (?1, 'FaceID', 'check_in', 'on_time', 'A', '2024-03-11', ?2)",
                params![alice, ts],
            )
        };
        insert("2024-03-11T01:00:00.000Z").unwrap();
        let err = insert("2024-03-11T01:00:00.001Z").unwrap_err();
        assert!(is_constraint(&err));
    }

    #[test]
    fn test_outside_hours_is_always_recorded() {
        let mut conn = conn();
        let alice = enroll(&conn, "alice");
        for minute in [0, 5, 10] {
            let outcome = attend(&mut conn, alice, at(11, 19, minute));
            assert!(outcome.event.is_some());
        }
        assert_eq!(attendance_count(&conn), 3);
    }

    #[test]
    fn test_delete_cascades_and_deactivate_preserves() {
        let mut conn = conn();
        let alice = enroll(&conn, "alice");
        let bob = enroll(&conn, "bob");
        attend(&mut conn, alice, at(11, 8, 0));
        attend(&mut conn, bob, at(11, 8, 0));

        assert!(deactivate_user(&conn, bob).unwrap());
        assert!(!deactivate_user(&conn, bob).unwrap());
        assert_eq!(templates(&conn).unwrap().len(), 1);
        assert!(find_by_qr(&conn, "QR-bob-1").unwrap().is_none());
        assert_eq!(attendance_count(&conn), 2);
        let refused = record_attendance(
            &mut conn,
            &ShiftSchedule::default(),
            &tz(),
            bob,
            Method::Qr,
            at(11, 12, 0),
        );
        assert!(matches!(refused, Err(StoreError::UserNotFound(_))));

        assert!(delete_user(&conn, alice).unwrap());
        assert_eq!(attendance_count(&conn), 1);
        assert!(!delete_user(&conn, alice).unwrap());
    }

    #[test]
    fn test_find_by_qr() {
        let conn = conn();
        let alice = enroll(&conn, "alice");
        assert_eq!(find_by_qr(&conn, "QR-alice-1").unwrap().unwrap().id, alice);
        assert!(find_by_qr(&conn, "QR-nobody").unwrap().is_none());
    }

    #[test]
    fn test_records_and_stats() {
        let mut conn = conn();
        let alice = enroll(&conn, "alice");
        let bob = enroll(&conn, "bob");
        attend(&mut conn, alice, at(11, 8, 0));
        attend(&mut conn, bob, at(11, 9, 0));
        attend(&mut conn, alice, at(11, 12, 0));
        attend(&mut conn, alice, at(10, 8, 0));

        let all = records(&conn, 100).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].check_type, "check_out");
        assert_eq!(records(&conn, 2).unwrap().len(), 2);

        let (start, end) = shift::local_day_bounds(&tz(), shift::local_day(&tz(), at(11, 20, 0)));
        let stats = daily_stats(&conn, start, end).unwrap();
        assert_eq!(stats.total_employees, 2);
        assert_eq!(stats.check_ins_today, 2);
        assert_eq!(stats.late_today, 1);
        assert_eq!(stats.on_time_today, 1);
        // the day-10 check-in belongs to another local day
        assert_eq!(stats.recent_activity.len(), 3);
        assert!(stats.recent_activity.iter().all(|r| r.timestamp.as_str() >= timestamp(start).as_str()));
        assert_eq!(stats.recent_activity[0].check_type, "check_out");

        let (start, end) = shift::local_day_bounds(&tz(), shift::local_day(&tz(), at(10, 20, 0)));
        let yesterday = daily_stats(&conn, start, end).unwrap();
        assert_eq!(yesterday.recent_activity.len(), 1);
        assert_eq!(yesterday.recent_activity[0].user_id, alice);
    }

    #[tokio::test]
    async fn test_async_store_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .insert_user("dana".into(), emb(&[0.5, 0.5]), "QR-dana-1".into(), at(1, 9, 0))
            .await
            .unwrap();

        let err = store
            .insert_user("dana".into(), emb(&[0.5, 0.5]), "QR-dana-2".into(), at(1, 9, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(_)));

        let outcome = store
            .record_attendance(ShiftSchedule::default(), tz(), id, Method::FaceIdWebRtc, at(11, 13, 0))
            .await
            .unwrap();
        assert_eq!(outcome.event.unwrap().method, "FaceID-WebRTC");

        assert_eq!(store.records(None).await.unwrap().len(), 1);
        let stats = store.daily_stats(&tz(), at(11, 20, 0)).await.unwrap();
        assert_eq!(stats.check_ins_today, 1);
        assert_eq!(store.list_users().await.unwrap().len(), 1);
    }

    #[test]
    fn test_method_strings() {
        for method in [Method::FaceId, Method::Qr, Method::FaceIdWebRtc] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("fingerprint"), None);
    }
}

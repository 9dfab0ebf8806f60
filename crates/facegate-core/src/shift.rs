//! Shift-aware attendance decisions.
//!
//! [`decide`] is a pure function of the current instant and the events the
//! user already has on that local day. All stored timestamps are UTC and are
//! converted to the site's local time before any time-of-day comparison.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShiftError {
    #[error("invalid shift schedule: {0}")]
    Invalid(String),
    #[error("schedule parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    CheckIn,
    CheckOut,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::CheckIn => "check_in",
            CheckType::CheckOut => "check_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in" => Some(CheckType::CheckIn),
            "check_out" => Some(CheckType::CheckOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
    EarlyLeave,
    OutsideHours,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::OnTime => "on_time",
            AttendanceStatus::Late => "late",
            AttendanceStatus::EarlyLeave => "early_leave",
            AttendanceStatus::OutsideHours => "outside_hours",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_time" => Some(AttendanceStatus::OnTime),
            "late" => Some(AttendanceStatus::Late),
            "early_leave" => Some(AttendanceStatus::EarlyLeave),
            "outside_hours" => Some(AttendanceStatus::OutsideHours),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One shift: `[start, end)` in local minutes since midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub id: String,
    pub label: String,
    #[serde(with = "hhmm")]
    pub start: u16,
    #[serde(with = "hhmm")]
    pub end: u16,
    /// A check-in after this minute is late.
    #[serde(with = "hhmm")]
    pub late_after: u16,
    /// A check-out before this minute is an early leave.
    #[serde(with = "hhmm")]
    pub early_before: u16,
}

impl ShiftWindow {
    pub fn contains(&self, minute: u16) -> bool {
        self.start <= minute && minute < self.end
    }
}

/// The site's shift windows, non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftSchedule {
    #[serde(rename = "shift")]
    pub windows: Vec<ShiftWindow>,
}

const fn hm(hour: u16, minute: u16) -> u16 {
    hour * 60 + minute
}

impl Default for ShiftSchedule {
    fn default() -> Self {
        Self {
            windows: vec![
                ShiftWindow {
                    id: "A".into(),
                    label: "Shift A".into(),
                    start: hm(7, 0),
                    end: hm(12, 45),
                    late_after: hm(8, 30),
                    early_before: hm(11, 30),
                },
                ShiftWindow {
                    id: "B".into(),
                    label: "Shift B".into(),
                    start: hm(12, 45),
                    end: hm(18, 0),
                    late_after: hm(14, 0),
                    early_before: hm(16, 30),
                },
            ],
        }
    }
}

impl ShiftSchedule {
    /// Parse `[[shift]]` tables and validate them.
    pub fn from_toml(text: &str) -> Result<Self, ShiftError> {
        let schedule: Self = toml::from_str(text)?;
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<(), ShiftError> {
        let mut sorted: Vec<&ShiftWindow> = self.windows.iter().collect();
        sorted.sort_by_key(|w| w.start);

        for w in &sorted {
            if w.start >= w.end || w.end > hm(24, 0) {
                return Err(ShiftError::Invalid(format!("shift {} has an empty or out-of-day range", w.id)));
            }
            if !(w.start..w.end).contains(&w.late_after) || !(w.start..w.end).contains(&w.early_before) {
                return Err(ShiftError::Invalid(format!("shift {} cutoffs fall outside the window", w.id)));
            }
        }
        for pair in sorted.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(ShiftError::Invalid(format!(
                    "shifts {} and {} overlap",
                    pair[0].id, pair[1].id
                )));
            }
        }
        let mut ids: Vec<&str> = self.windows.iter().map(|w| w.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.windows.len() {
            return Err(ShiftError::Invalid("duplicate shift id".into()));
        }
        Ok(())
    }

    /// Shift containing a local minute of day, if any.
    pub fn window_at(&self, minute: u16) -> Option<&ShiftWindow> {
        self.windows.iter().find(|w| w.contains(minute))
    }
}

/// An attendance event already stored for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub check_type: CheckType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Append an event of this type and status.
    Record {
        check_type: CheckType,
        status: AttendanceStatus,
        /// `None` for outside-hours check-ins.
        shift: Option<String>,
    },
    /// The shift already has both events; nothing is written.
    ShiftCompleted { shift: String },
}

impl Decision {
    pub fn shift(&self) -> Option<&str> {
        match self {
            Decision::Record { shift, .. } => shift.as_deref(),
            Decision::ShiftCompleted { shift } => Some(shift),
        }
    }
}

/// Local minute of day for a UTC instant.
pub fn local_minute<Tz: TimeZone>(tz: &Tz, at: DateTime<Utc>) -> u16 {
    let local = at.with_timezone(tz);
    (local.hour() * 60 + local.minute()) as u16
}

/// Local calendar day for a UTC instant.
pub fn local_day<Tz: TimeZone>(tz: &Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(tz).date_naive()
}

/// UTC bounds `[start, end)` of a local calendar day.
pub fn local_day_bounds<Tz: TimeZone>(tz: &Tz, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let to_utc = |date: NaiveDate| {
        let midnight = date.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&midnight)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    };
    let next = day.succ_opt().unwrap_or(day);
    (to_utc(day), to_utc(next))
}

/// Decide what a new attendance attempt at `now` records.
///
/// `events` are the user's stored events; those on a different local day
/// than `now` are ignored.
pub fn decide<Tz: TimeZone>(
    schedule: &ShiftSchedule,
    tz: &Tz,
    now: DateTime<Utc>,
    events: &[RecordedEvent],
) -> Decision {
    let minute = local_minute(tz, now);
    let Some(window) = schedule.window_at(minute) else {
        return Decision::Record {
            check_type: CheckType::CheckIn,
            status: AttendanceStatus::OutsideHours,
            shift: None,
        };
    };

    let today = local_day(tz, now);
    let in_shift = events.iter().filter(|e| {
        local_day(tz, e.timestamp) == today && window.contains(local_minute(tz, e.timestamp))
    });
    let (mut has_in, mut has_out) = (false, false);
    for event in in_shift {
        match event.check_type {
            CheckType::CheckIn => has_in = true,
            CheckType::CheckOut => has_out = true,
        }
    }

    let decision = if has_in && has_out {
        Decision::ShiftCompleted {
            shift: window.id.clone(),
        }
    } else if !has_in {
        let status = if minute > window.late_after {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::OnTime
        };
        Decision::Record {
            check_type: CheckType::CheckIn,
            status,
            shift: Some(window.id.clone()),
        }
    } else {
        let status = if minute < window.early_before {
            AttendanceStatus::EarlyLeave
        } else {
            AttendanceStatus::OnTime
        };
        Decision::Record {
            check_type: CheckType::CheckOut,
            status,
            shift: Some(window.id.clone()),
        }
    };

    tracing::debug!(shift = %window.id, minute, ?decision, "shift decision");
    decision
}

/// `"HH:MM"` <-> minutes since midnight.
mod hhmm {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(minute: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:02}:{:02}", minute / 60, minute % 60))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| de::Error::custom(format!("expected HH:MM, got {text:?}")))
    }

    pub(super) fn parse(text: &str) -> Option<u16> {
        let (h, m) = text.split_once(':')?;
        let (h, m): (u16, u16) = (h.trim().parse().ok()?, m.trim().parse().ok()?);
        (m < 60 && (h < 24 || (h == 24 && m == 0))).then_some(h * 60 + m)
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Mysql, PrimaryMode};

/// Observation errors are kept short; the full story lives in the logs.
pub const MAX_LAST_ERROR: usize = 256;

/// One observer/destination pair. `from_id == -1` is the coordinator.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub struct StateKey {
    pub from_id: i32,
    pub to_id: i32,
}

/// Latest observation of `to_id` as seen from `from_id`. Durations are
/// re-derived from the current wall clock on every merge, so they are
/// non-negative and only grow between merges.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct MysqlState {
    #[serde(flatten)]
    pub key: StateKey,

    pub green_time: DateTime<Utc>,
    #[serde(with = "duration_ns")]
    pub green_duration: Duration,

    pub yellow_time: DateTime<Utc>,
    #[serde(with = "duration_ns")]
    pub yellow_duration: Duration,

    pub red_time: DateTime<Utc>,
    #[serde(with = "duration_ns")]
    pub red_duration: Duration,

    pub last_error: String,
    pub error_count: i32,
}

impl MysqlState {
    pub fn new(key: StateKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Merge one dial result. Success marks green and clears the failure
    /// streak; failure marks red and records a truncated error. The yellow
    /// timestamp is refreshed either way, proving the observer itself is
    /// alive.
    pub fn merge_dial(&mut self, now: DateTime<Utc>, error: Option<&str>) {
        match error {
            None => {
                self.error_count = 0;
                self.green_time = now;
            }
            Some(e) => {
                self.error_count += 1;
                self.red_time = now;
                self.last_error = truncate(e, MAX_LAST_ERROR);
            }
        }
        self.yellow_time = now;
        self.refresh_durations(now);
    }

    /// Staleness of the observer itself: how long since this entry was last
    /// touched by any merge.
    pub fn refresh_yellow(&mut self, now: DateTime<Utc>) {
        self.yellow_duration = since(now, self.yellow_time);
    }

    /// Re-derive all three durations from `now`, clamping to zero when a
    /// reporter's clock runs ahead of ours.
    pub fn refresh_durations(&mut self, now: DateTime<Utc>) {
        self.green_duration = since(now, self.green_time);
        self.yellow_duration = since(now, self.yellow_time);
        self.red_duration = since(now, self.red_time);
    }
}

fn since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// The compact intent tuple exchanged with every agent report.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct SizeSpec {
    pub primary_mode: PrimaryMode,
    pub primaries: i32,
    pub replicas: i32,
    pub primary_id: i32,
    pub auto_switch: bool,
}

impl SizeSpec {
    pub fn of(mysql: &Mysql) -> Self {
        mysql.size_spec()
    }
}

/// Agent-to-coordinator report. States are carried opaquely; the coordinator
/// re-parses and validates each entry on ingest.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MysqlReport {
    pub name: String,
    #[serde(flatten)]
    pub size_spec: SizeSpec,
    #[serde(default)]
    pub states: Vec<serde_json::Value>,
    #[serde(default)]
    pub hang: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ReportResult {
    pub receive_time: DateTime<Utc>,
    #[serde(flatten)]
    pub size_spec: SizeSpec,
}

/// The `{ "Data": ..., "Error": ... }` envelope every JSON endpoint speaks.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Envelope<T> {
    #[serde(rename = "Data")]
    pub data: Option<T>,
    #[serde(rename = "Error")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn data(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }

    /// Unwrap the payload, turning a set `Error` field into an `Err`.
    pub fn into_result(self) -> Result<T, String> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.data.ok_or_else(|| "empty response".to_string())
    }
}

mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.as_nanos().min(i64::MAX as u128) as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ns = i64::deserialize(d)?;
        Ok(Duration::from_nanos(ns.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn merge_success_clears_failure_streak() {
        let now = Utc::now();
        let mut s = MysqlState::new(StateKey { from_id: 1, to_id: 0 });
        s.merge_dial(now, Some("connection refused"));
        s.merge_dial(now, Some("connection refused"));
        assert_eq!(s.error_count, 2);
        assert_eq!(s.last_error, "connection refused");

        s.merge_dial(now + TimeDelta::seconds(5), None);
        assert_eq!(s.error_count, 0);
        assert_eq!(s.green_duration, Duration::ZERO);
        assert_eq!(s.red_duration, Duration::from_secs(5));
    }

    #[test]
    fn durations_never_negative() {
        let now = Utc::now();
        let mut s = MysqlState::new(StateKey { from_id: 0, to_id: 1 });
        s.green_time = now + TimeDelta::seconds(30); // reporter clock ahead
        s.refresh_durations(now);
        assert_eq!(s.green_duration, Duration::ZERO);
    }

    #[test]
    fn long_errors_are_truncated() {
        let now = Utc::now();
        let mut s = MysqlState::new(StateKey { from_id: 0, to_id: 1 });
        let long = "x".repeat(MAX_LAST_ERROR * 2);
        s.merge_dial(now, Some(&long));
        assert_eq!(s.last_error.len(), MAX_LAST_ERROR);
    }

    #[test]
    fn state_round_trips_with_flattened_key() {
        let now = Utc::now();
        let mut s = MysqlState::new(StateKey { from_id: 2, to_id: 0 });
        s.merge_dial(now, Some("timed out"));

        let v = serde_json::to_value(&s).expect("serialize");
        assert_eq!(v["FromId"], 2);
        assert_eq!(v["ToId"], 0);
        assert!(v["RedDuration"].is_i64());

        let back: MysqlState = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, s);
    }

    #[test]
    fn envelope_error_wins() {
        let e: Envelope<i32> = Envelope::error("boom");
        assert_eq!(e.into_result(), Err("boom".to_string()));
        let d = Envelope::data(7);
        assert_eq!(d.into_result(), Ok(7));
    }
}

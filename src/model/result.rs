//! Timing and outcome of one execution attempt.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

/// What a worker knows about the attempt in progress. Not persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobResult {
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl JobResult {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            start_timestamp: Some(at),
            ..Self::default()
        }
    }

    /// `end - start` when both are set, `now - start` while running,
    /// `None` before the attempt starts.
    pub fn duration(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        let start = self.start_timestamp?;
        Some(self.end_timestamp.unwrap_or(now) - start)
    }

    /// Log payload. Unset fields are omitted; timestamps and the duration
    /// are seconds as floats.
    pub fn as_dict(&self, now: DateTime<Utc>) -> Map<String, Value> {
        let mut dict = Map::new();
        if let Some(start) = self.start_timestamp {
            dict.insert("start_timestamp".into(), epoch_seconds(start).into());
        }
        if let Some(end) = self.end_timestamp {
            dict.insert("end_timestamp".into(), epoch_seconds(end).into());
        }
        if let Some(duration) = self.duration(now) {
            dict.insert("duration".into(), seconds(duration).into());
        }
        if let Some(ref result) = self.result {
            dict.insert("result".into(), result.clone());
        }
        dict
    }
}

pub(crate) fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6
}

pub(crate) fn seconds(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

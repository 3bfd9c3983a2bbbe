use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Daily time range, `HH:MM` on the wire. `start > end` spans midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl TimeRange {
    pub fn contains(&self, at: NaiveTime) -> bool {
        if self.start_time <= self.end_time {
            at >= self.start_time && at < self.end_time
        } else {
            // Overnight range (e.g. 23:00 - 03:00)
            at >= self.start_time || at < self.end_time
        }
    }
}

/// Named recurring period during which matching notifications are held back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteTimeInterval {
    pub name: String,
    #[serde(default)]
    pub times: Vec<TimeRange>,
    /// Days the interval applies to; empty means every day.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
}

impl MuteTimeInterval {
    /// Whether `now` (UTC) falls inside the interval. An interval with
    /// neither times nor weekdays mutes around the clock.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.weekdays.is_empty() && !self.weekdays.contains(&now.weekday()) {
            return false;
        }
        if self.times.is_empty() {
            return true;
        }
        let t = now.time();
        self.times.iter().any(|r| r.contains(t))
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

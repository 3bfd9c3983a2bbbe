use crate::labels::{ALERTNAME_LABEL, FIELD_SEPARATOR, FOLDER_TITLE_LABEL};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use xxhash_rust::xxh3::Xxh3;

/// Group-by value that groups by every label.
pub const GROUP_BY_ALL: &str = "...";

/// Group-by applied when a rule does not override it.
pub fn default_group_by() -> Vec<String> {
    vec![ALERTNAME_LABEL.to_string(), FOLDER_TITLE_LABEL.to_string()]
}

/// Per-rule notification routing overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub receiver: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<String>,
}

/// Content hash of a [`NotificationSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl NotificationSettings {
    /// Settings with only a receiver.
    pub fn new(receiver: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            ..Default::default()
        }
    }

    /// Group-by with the mandatory labels injected in front when missing.
    ///
    /// # Examples
    ///
    /// ```
    /// use oxalert_common::settings::NotificationSettings;
    ///
    /// let mut s = NotificationSettings::new("ops");
    /// s.group_by = vec!["instance".into()];
    /// assert_eq!(s.normalized_group_by(), vec!["alertname", "folder_title", "instance"]);
    ///
    /// s.group_by = vec!["instance".into(), "...".into()];
    /// assert_eq!(s.normalized_group_by(), vec!["..."]);
    /// ```
    pub fn normalized_group_by(&self) -> Vec<String> {
        if self.group_by.is_empty() {
            return default_group_by();
        }
        if self.group_by.iter().any(|l| l == GROUP_BY_ALL) {
            return vec![GROUP_BY_ALL.to_string()];
        }

        let mut out = Vec::with_capacity(self.group_by.len() + 2);
        if !self.group_by.iter().any(|l| l == ALERTNAME_LABEL) {
            out.push(ALERTNAME_LABEL.to_string());
        }
        if !self.group_by.iter().any(|l| l == FOLDER_TITLE_LABEL) {
            out.push(FOLDER_TITLE_LABEL.to_string());
        }
        out.extend(self.group_by.iter().cloned());
        out
    }

    fn groups_by_mandatory_only(&self) -> bool {
        self.normalized_group_by()
            .iter()
            .all(|l| l == ALERTNAME_LABEL || l == FOLDER_TITLE_LABEL)
    }

    /// True when nothing but the receiver is set.
    pub fn is_all_default(&self) -> bool {
        self.groups_by_mandatory_only()
            && self.group_wait.is_none()
            && self.group_interval.is_none()
            && self.repeat_interval.is_none()
            && self.mute_time_intervals.is_empty()
    }

    /// Hash over every field. Group-by order matters unless it normalizes to
    /// the mandatory labels alone; mute time interval order never matters.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut h = Xxh3::new();
        let write_str = |h: &mut Xxh3, s: &str| {
            h.update(s.as_bytes());
            h.update(&[FIELD_SEPARATOR]);
        };
        let write_list = |h: &mut Xxh3, items: &[String]| {
            h.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                h.update(item.as_bytes());
                h.update(&[FIELD_SEPARATOR]);
            }
            h.update(&[FIELD_SEPARATOR]);
        };
        let write_duration = |h: &mut Xxh3, d: Option<Duration>| {
            match d {
                Some(d) => {
                    h.update(&[1]);
                    h.update(&(d.as_nanos() as u64).to_le_bytes());
                }
                None => h.update(&[0]),
            }
            h.update(&[FIELD_SEPARATOR]);
        };

        write_str(&mut h, &self.receiver);

        if self.groups_by_mandatory_only() {
            write_list(&mut h, &default_group_by());
        } else {
            write_list(&mut h, &self.normalized_group_by());
        }

        write_duration(&mut h, self.group_wait);
        write_duration(&mut h, self.group_interval);
        write_duration(&mut h, self.repeat_interval);

        let mut mute = self.mute_time_intervals.clone();
        mute.sort();
        write_list(&mut h, &mute);

        Fingerprint(h.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(receiver: &str) -> NotificationSettings {
        NotificationSettings::new(receiver)
    }

    #[test]
    fn fingerprint_is_stable_for_equal_values() {
        let mut a = settings("ops");
        a.group_by = vec!["instance".into()];
        a.group_wait = Some(Duration::from_secs(30));
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_renders_as_hex() {
        let fp = Fingerprint(0xabc);
        assert_eq!(fp.to_string(), "0000000000000abc");
        assert_eq!(settings("ops").fingerprint().to_string().len(), 16);
    }

    #[test]
    fn mandatory_group_by_order_is_irrelevant() {
        let mut a = settings("ops");
        a.group_by = vec![ALERTNAME_LABEL.into(), FOLDER_TITLE_LABEL.into()];
        let mut b = settings("ops");
        b.group_by = vec![FOLDER_TITLE_LABEL.into(), ALERTNAME_LABEL.into()];
        let c = settings("ops");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
        assert!(a.is_all_default());
        assert!(b.is_all_default());
    }

    #[test]
    fn custom_group_by_order_matters() {
        let mut a = settings("ops");
        a.group_by = vec!["instance".into(), "job".into()];
        let mut b = settings("ops");
        b.group_by = vec!["job".into(), "instance".into()];
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn mute_time_intervals_are_order_independent() {
        let mut a = settings("ops");
        a.mute_time_intervals = vec!["weekends".into(), "nights".into()];
        let mut b = settings("ops");
        b.mute_time_intervals = vec!["nights".into(), "weekends".into()];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_mute_time_intervals_differ() {
        let mut a = settings("ops");
        a.mute_time_intervals = vec!["weekends".into()];
        let mut b = settings("ops");
        b.mute_time_intervals = vec!["nights".into()];
        let mut c = settings("ops");
        c.mute_time_intervals = vec!["weekends".into(), "nights".into()];
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), settings("ops").fingerprint());
    }

    #[test]
    fn timing_fields_are_not_interchangeable() {
        let mut a = settings("ops");
        a.group_wait = Some(Duration::from_secs(10));
        let mut b = settings("ops");
        b.group_interval = Some(Duration::from_secs(10));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn deserializes_humantime_durations() {
        let json = r#"{"receiver":"ops","group_wait":"30s","repeat_interval":"4h"}"#;
        let s: NotificationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.group_wait, Some(Duration::from_secs(30)));
        assert_eq!(s.repeat_interval, Some(Duration::from_secs(4 * 3600)));
        assert!(!s.is_all_default());
    }
}

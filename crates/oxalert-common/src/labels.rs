use std::collections::BTreeMap;
use xxhash_rust::xxh3::Xxh3;

/// A label set. Ordered so that hashing and rendering are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Rule title, attached to every outgoing alert.
pub const ALERTNAME_LABEL: &str = "alertname";
/// Folder the rule lives in, attached to every outgoing alert.
pub const FOLDER_TITLE_LABEL: &str = "folder_title";
pub const RULE_UID_LABEL: &str = "__alert_rule_uid__";

/// Sentinel label matched by the root of the autogenerated routing subtree.
pub const AUTOGENERATED_LABEL: &str = "__oxalert_autogenerated__";
pub const RECEIVER_LABEL: &str = "__oxalert_receiver__";
pub const SETTINGS_HASH_LABEL: &str = "__oxalert_settings_hash__";

/// Separator written after every hashed field so that `("ab", "c")` and
/// `("a", "bc")` never collide.
pub const FIELD_SEPARATOR: u8 = 0xff;

/// Stable 64-bit hash of a label set.
///
/// # Examples
///
/// ```
/// use oxalert_common::labels::{labels_fingerprint, Labels};
///
/// let mut a = Labels::new();
/// a.insert("instance".into(), "web-01".into());
/// let mut b = Labels::new();
/// b.insert("instance".into(), "web-02".into());
/// assert_eq!(labels_fingerprint(&a), labels_fingerprint(&a.clone()));
/// assert_ne!(labels_fingerprint(&a), labels_fingerprint(&b));
/// ```
pub fn labels_fingerprint(labels: &Labels) -> u64 {
    let mut hasher = Xxh3::new();
    for (name, value) in labels {
        hasher.update(name.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
        hasher.update(value.as_bytes());
        hasher.update(&[FIELD_SEPARATOR]);
    }
    hasher.digest()
}

/// Returns true for labels that only steer routing and must not be shown
/// to humans.
pub fn is_internal_label(name: &str) -> bool {
    name.starts_with("__") && name.ends_with("__")
}

/// Format a label set as `k=v, k=v`, hiding internal labels.
///
/// # Examples
///
/// ```
/// use oxalert_common::labels::{format_labels, Labels};
///
/// let mut labels = Labels::new();
/// labels.insert("mount".to_string(), "/data".to_string());
/// labels.insert("device".to_string(), "sda1".to_string());
/// labels.insert("__alert_rule_uid__".to_string(), "abc".to_string());
/// assert_eq!(format_labels(&labels), "device=sda1, mount=/data");
/// ```
pub fn format_labels(labels: &Labels) -> String {
    labels
        .iter()
        .filter(|(k, _)| !is_internal_label(k))
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

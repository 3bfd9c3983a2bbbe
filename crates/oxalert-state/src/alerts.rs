use crate::state::{AlertInstance, AlertState};
use oxalert_common::labels::{
    Labels, ALERTNAME_LABEL, AUTOGENERATED_LABEL, FOLDER_TITLE_LABEL, RECEIVER_LABEL,
    RULE_UID_LABEL, SETTINGS_HASH_LABEL,
};
use oxalert_common::types::{AlertRule, PostableAlert};

/// Annotation carrying the execution error of an instance in `Error`.
pub const ERROR_ANNOTATION: &str = "__error__";

/// Builds the payloads for one instance, one per notification settings
/// block of the rule, or a single untagged one when it has none.
///
/// Firing instances carry their heartbeat `ends_at`; anything else is sent
/// as resolved at the time it left `Alerting`.
pub fn to_postable_alerts(rule: &AlertRule, instance: &AlertInstance) -> Vec<PostableAlert> {
    let mut labels = instance.labels.clone();
    labels.insert(ALERTNAME_LABEL.to_string(), rule.title.clone());
    labels.insert(FOLDER_TITLE_LABEL.to_string(), rule.folder_title.clone());
    labels.insert(RULE_UID_LABEL.to_string(), rule.uid.clone());

    let mut annotations = rule.annotations.clone();
    if let Some(err) = &instance.error {
        annotations.insert(ERROR_ANNOTATION.to_string(), err.clone());
    }

    let ends_at = if instance.state == AlertState::Alerting {
        instance.ends_at
    } else {
        instance.state_since
    };

    let build = |labels: Labels| PostableAlert {
        labels,
        annotations: annotations.clone(),
        starts_at: instance.starts_at,
        ends_at,
        generator_url: String::new(),
    };

    if rule.notification_settings.is_empty() {
        return vec![build(labels)];
    }

    rule.notification_settings
        .iter()
        .map(|settings| {
            let mut tagged = labels.clone();
            tagged.insert(AUTOGENERATED_LABEL.to_string(), "true".to_string());
            tagged.insert(RECEIVER_LABEL.to_string(), settings.receiver.clone());
            if !settings.is_all_default() {
                tagged.insert(
                    SETTINGS_HASH_LABEL.to_string(),
                    settings.fingerprint().to_string(),
                );
            }
            build(tagged)
        })
        .collect()
}

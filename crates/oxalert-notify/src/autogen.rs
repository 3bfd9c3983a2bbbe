//! Routes generated from the notification settings of a tenant's rules.
//!
//! Rules that carry identical settings share one route. The subtree has
//! three levels:
//!
//! 1. a root matching `__oxalert_autogenerated__="true"`,
//! 2. one child per receiver with the default group-by,
//! 3. one child per non-default settings fingerprint carrying the overrides.
//!
//! Regenerating for the same input yields the same tree, and splicing
//! replaces the previous subtree in place.

use crate::config::AlertmanagerConfig;
use crate::error::{NotifyError, Result};
use crate::routing::{Matcher, Route};
use oxalert_common::labels::{AUTOGENERATED_LABEL, RECEIVER_LABEL, SETTINGS_HASH_LABEL};
use oxalert_common::settings::{default_group_by, Fingerprint, NotificationSettings};
use std::collections::BTreeMap;

fn sentinel() -> Matcher {
    Matcher::equal(AUTOGENERATED_LABEL, "true")
}

/// Whether `route` is the root of a generated subtree.
pub fn is_autogenerated_root(route: &Route) -> bool {
    route.matchers.contains(&sentinel())
}

fn validate(settings: &NotificationSettings, config: &AlertmanagerConfig) -> Result<()> {
    if !config.receivers.iter().any(|r| r.name == settings.receiver) {
        return Err(NotifyError::InvalidSettings(format!(
            "receiver '{}' does not exist",
            settings.receiver
        )));
    }
    for name in &settings.mute_time_intervals {
        if config.mute_time_interval(name).is_none() {
            return Err(NotifyError::InvalidSettings(format!(
                "mute time interval '{name}' does not exist"
            )));
        }
    }
    Ok(())
}

fn settings_route(fp: Fingerprint, settings: &NotificationSettings) -> Route {
    Route {
        receiver: Some(settings.receiver.clone()),
        matchers: vec![Matcher::equal(SETTINGS_HASH_LABEL, fp.to_string())],
        group_by: Some(settings.normalized_group_by()),
        group_wait: settings.group_wait,
        group_interval: settings.group_interval,
        repeat_interval: settings.repeat_interval,
        mute_time_intervals: settings.mute_time_intervals.clone(),
        ..Default::default()
    }
}

/// Builds the generated subtree for `config` and the rules' `settings`.
///
/// Every configured receiver gets a route even when no rule uses it.
/// Settings referencing an unknown receiver or mute time interval are
/// skipped with a warning when `skip_invalid` is set, otherwise the first
/// one is returned as [`NotifyError::InvalidSettings`].
pub fn generate_routes<I>(config: &AlertmanagerConfig, settings: I, skip_invalid: bool) -> Result<Route>
where
    I: IntoIterator<Item = NotificationSettings>,
{
    let mut by_receiver: BTreeMap<String, BTreeMap<Fingerprint, NotificationSettings>> =
        BTreeMap::new();
    for name in config.receiver_names() {
        let default = NotificationSettings::new(name.clone());
        by_receiver
            .entry(name)
            .or_default()
            .insert(default.fingerprint(), default);
    }

    for s in settings {
        if let Err(e) = validate(&s, config) {
            if skip_invalid {
                tracing::warn!(receiver = %s.receiver, error = %e, "Skipping invalid notification settings");
                continue;
            }
            return Err(e);
        }
        by_receiver
            .entry(s.receiver.clone())
            .or_default()
            .entry(s.fingerprint())
            .or_insert(s);
    }

    let receivers = by_receiver
        .into_iter()
        .map(|(receiver, fingerprints)| Route {
            receiver: Some(receiver.clone()),
            matchers: vec![Matcher::equal(RECEIVER_LABEL, receiver)],
            group_by: Some(default_group_by()),
            routes: fingerprints
                .iter()
                .filter(|(_, s)| !s.is_all_default())
                .map(|(fp, s)| settings_route(*fp, s))
                .collect(),
            ..Default::default()
        })
        .collect();

    Ok(Route {
        matchers: vec![sentinel()],
        continue_matching: false,
        routes: receivers,
        ..Default::default()
    })
}

/// Replaces any previously generated subtree of `config` with `root`,
/// placed as the first child of the user's root route.
pub fn splice_routes(config: &mut AlertmanagerConfig, root: Route) {
    config.route.routes.retain(|r| !is_autogenerated_root(r));
    config.route.routes.insert(0, root);
}

/// [`generate_routes`] followed by [`splice_routes`].
pub fn apply_autogenerated_routes<I>(
    config: &mut AlertmanagerConfig,
    settings: I,
    skip_invalid: bool,
) -> Result<()>
where
    I: IntoIterator<Item = NotificationSettings>,
{
    let root = generate_routes(config, settings, skip_invalid)?;
    splice_routes(config, root);
    Ok(())
}

//! Event name normalization and destination naming.

use crate::config::EventBusConfig;

/// Derive the wire name for a raw event type name.
///
/// When the respective flag is enabled this strips **runs of characters**
/// belonging to the configured prefix/suffix sets, not a literal substring:
/// `"XXOrderCreated"` with prefix set `"X"` loses every leading `X`. This
/// reproduces the character-set trimming of the system this bus is wire
/// compatible with; both sides must agree on the resulting names.
///
/// Normalization is idempotent: the first character a trim leaves in place
/// is by construction outside the set, so a second pass removes nothing.
pub fn normalize(raw_name: &str, config: &EventBusConfig) -> String {
    let mut name = raw_name;

    if config.delete_event_prefix {
        name = name.trim_start_matches(|c: char| config.event_name_prefix.contains(c));
    }
    if config.delete_event_suffix {
        name = name.trim_end_matches(|c: char| config.event_name_suffix.contains(c));
    }

    name.to_string()
}

/// Per-subscriber destination name: `"{subscriber_app_name}.{event_name}"`.
///
/// Accepts raw or normalized input; the event part is normalized either way.
pub fn subscription_name(raw_name: &str, config: &EventBusConfig) -> String {
    format!("{}.{}", config.subscriber_app_name, normalize(raw_name, config))
}

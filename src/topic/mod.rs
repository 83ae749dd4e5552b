//! Topic names and filters
//!
//! Client-side checks run before anything is put on the wire, so a bad topic
//! is reported per call instead of getting the connection closed by the
//! broker. Inbound PUBLISH packets are routed to callbacks with
//! [`topic_matches_filter`].

/// Longest string MQTT can carry in a length-prefixed field
const MAX_TOPIC_LEN: usize = 65_535;

fn check_common(topic: &str, empty: &'static str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err(empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Validate a topic name used in PUBLISH. Wildcards are not allowed.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic, "topic name cannot be empty")?;
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE and UNSUBSCRIBE.
///
/// `+` must fill a whole level. `#` must fill a whole level and be the last
/// one. `$share/{group}/{filter}` is accepted and the inner filter checked.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter, "topic filter cannot be empty")?;

    let inner = match filter.strip_prefix("$share/") {
        Some(rest) => {
            let (group, inner) = rest
                .split_once('/')
                .ok_or("invalid shared subscription format")?;
            if group.is_empty() || group.contains(['+', '#']) {
                return Err("invalid shared subscription group");
            }
            if inner.is_empty() {
                return Err("shared subscription filter cannot be empty");
            }
            inner
        }
        None => filter,
    };

    let mut levels = inner.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err("multi-level wildcard must be last level");
            }
            "#" | "+" => {}
            _ if level.contains('#') => {
                return Err("multi-level wildcard must occupy entire level");
            }
            _ if level.contains('+') => {
                return Err("single-level wildcard must occupy entire level");
            }
            _ => {}
        }
    }

    Ok(())
}

/// The filter a broker matches against, with any `$share/{group}/` removed
pub fn effective_filter(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, inner)| inner)
        .unwrap_or(filter)
}

/// Check whether a topic name matches a (possibly shared) topic filter.
///
/// Topics starting with `$` are not matched by filters starting with a
/// wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let filter = effective_filter(filter);

    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

//! Subscription registry
//!
//! Filters the client is subscribed to and the callbacks registered for
//! each. It outlives individual connections so subscriptions can be
//! restored after a reconnect.

use std::collections::BTreeMap;

use crate::pubsub::SubscribeCallback;
use crate::topic::topic_matches_filter;

struct Registration {
    id: u64,
    callback: SubscribeCallback,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    filters: BTreeMap<String, Vec<Registration>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for a filter; returns a handle for [`Self::remove`]
    pub fn add(&mut self, filter: &str, callback: SubscribeCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.filters
            .entry(filter.to_string())
            .or_default()
            .push(Registration { id, callback });
        id
    }

    /// Remove one registration; the filter goes once it has none left
    pub fn remove(&mut self, filter: &str, id: u64) -> bool {
        let Some(registrations) = self.filters.get_mut(filter) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            self.filters.remove(filter);
        }
        removed
    }

    /// Remove a filter with all its callbacks
    pub fn remove_filter(&mut self, filter: &str) -> bool {
        self.filters.remove(filter).is_some()
    }

    /// Every registered filter, in sorted order
    pub fn filters(&self) -> Vec<String> {
        self.filters.keys().cloned().collect()
    }

    /// Callbacks of every filter matching `topic`
    pub fn matching(&self, topic: &str) -> Vec<SubscribeCallback> {
        self.filters
            .iter()
            .filter(|(filter, _)| topic_matches_filter(topic, filter))
            .flat_map(|(_, registrations)| registrations.iter().map(|r| r.callback.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.filters.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

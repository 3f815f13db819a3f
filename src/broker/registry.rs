//! Subscription registry
//!
//! Subscriptions are indexed by filter, with a secondary index by client id so
//! a disconnect can drop everything a client owns in one call. The registry is
//! plain data; the broker keeps it behind a lock and every method here runs
//! under that lock, which is what makes `remove_all` atomic with respect to
//! `matching`.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;

use crate::broker::message::QoS;
use crate::broker::topic;

pub type SubscriberId = String;

/// How to resolve a client whose subscriptions overlap on one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// One delivery per client, at the highest QoS among its matching filters.
    #[default]
    Maximum,
    /// One delivery per matching subscription, each at its own QoS.
    PerSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: SubscriberId,
    pub filter: String,
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_filter: HashMap<String, HashMap<SubscriberId, QoS>>,
    by_client: HashMap<SubscriberId, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subscription, or update its QoS if the client already holds
    /// this filter. Returns the previous QoS when it was a replacement.
    pub fn add(&mut self, client_id: &str, filter: &str, qos: QoS) -> Option<QoS> {
        self.by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(filter.to_string());

        self.by_filter
            .entry(filter.to_string())
            .or_default()
            .insert(client_id.to_string(), qos)
    }

    /// Remove one subscription. Returns false if it did not exist.
    pub fn remove(&mut self, client_id: &str, filter: &str) -> bool {
        let removed = match self.by_filter.get_mut(filter) {
            Some(subscribers) => {
                let removed = subscribers.remove(client_id).is_some();
                if subscribers.is_empty() {
                    self.by_filter.remove(filter);
                }
                removed
            }
            None => false,
        };

        if let Some(filters) = self.by_client.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                self.by_client.remove(client_id);
            }
        }

        removed
    }

    /// Remove every subscription owned by `client_id`. Returns how many were removed.
    pub fn remove_all(&mut self, client_id: &str) -> usize {
        let Some(filters) = self.by_client.remove(client_id) else {
            return 0;
        };

        for filter in &filters {
            if let Some(subscribers) = self.by_filter.get_mut(filter) {
                subscribers.remove(client_id);
                if subscribers.is_empty() {
                    self.by_filter.remove(filter);
                }
            }
        }

        filters.len()
    }

    /// Every `(client_id, qos)` whose filter matches `topic`, ordered by client id.
    ///
    /// Under `OverlapPolicy::Maximum` each client appears once with the highest
    /// QoS of its matching filters. Under `PerSubscription` a client appears
    /// once per matching filter, ordered by filter within the client.
    pub fn matching(&self, topic: &str, policy: OverlapPolicy) -> Vec<(SubscriberId, QoS)> {
        match policy {
            OverlapPolicy::Maximum => {
                let mut best: BTreeMap<&str, QoS> = BTreeMap::new();
                for (filter, subscribers) in &self.by_filter {
                    if !topic::matches(topic, filter) {
                        continue;
                    }
                    for (client_id, qos) in subscribers {
                        best.entry(client_id.as_str())
                            .and_modify(|current| *current = (*current).max(*qos))
                            .or_insert(*qos);
                    }
                }
                best.into_iter()
                    .map(|(client_id, qos)| (client_id.to_string(), qos))
                    .collect()
            }
            OverlapPolicy::PerSubscription => {
                let mut all: Vec<(&str, &str, QoS)> = Vec::new();
                for (filter, subscribers) in &self.by_filter {
                    if !topic::matches(topic, filter) {
                        continue;
                    }
                    for (client_id, qos) in subscribers {
                        all.push((client_id.as_str(), filter.as_str(), *qos));
                    }
                }
                all.sort_unstable();
                all.into_iter()
                    .map(|(client_id, _, qos)| (client_id.to_string(), qos))
                    .collect()
            }
        }
    }

    /// Subscriptions held by one client, ordered by filter.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<Subscription> {
        let Some(filters) = self.by_client.get(client_id) else {
            return Vec::new();
        };

        let mut subscriptions: Vec<Subscription> = filters
            .iter()
            .filter_map(|filter| {
                self.by_filter
                    .get(filter)
                    .and_then(|subscribers| subscribers.get(client_id))
                    .map(|qos| Subscription {
                        client_id: client_id.to_string(),
                        filter: filter.clone(),
                        qos: *qos,
                    })
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));
        subscriptions
    }

    pub fn len(&self) -> usize {
        self.by_filter.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_filter.is_empty()
    }
}

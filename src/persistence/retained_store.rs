//! Retained message store
//!
//! Keeps the last retained message per topic so it can be replayed to
//! clients that subscribe later. Storage is in-memory and lives as long as
//! the broker.
//!
//! Policy options:
//! - `clear_on_empty`: a retained publish with an empty payload removes the
//!   topic's entry instead of storing an empty message.

use std::collections::BTreeMap;

use crate::broker::message::Message;
use crate::broker::topic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedEntry {
    pub topic: String,
    pub message: Message,
    /// Milliseconds since the UNIX epoch when the entry was stored.
    pub stored_at: i64,
}

/// What `store_message` did with a retained publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainOutcome {
    Stored,
    Replaced,
    Cleared,
    /// Empty-payload clear for a topic that had no entry.
    Unchanged,
}

#[derive(Debug)]
pub struct RetainedStore {
    entries: BTreeMap<String, RetainedEntry>,
    clear_on_empty: bool,
}

impl RetainedStore {
    pub fn new(clear_on_empty: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            clear_on_empty,
        }
    }

    /// Store `message` as the retained message for its topic, latest wins.
    pub fn store_message(&mut self, message: &Message) -> RetainOutcome {
        if self.clear_on_empty && message.payload.is_empty() {
            return match self.entries.remove(&message.topic) {
                Some(_) => RetainOutcome::Cleared,
                None => RetainOutcome::Unchanged,
            };
        }

        let entry = RetainedEntry {
            topic: message.topic.clone(),
            message: message.clone(),
            stored_at: chrono::Utc::now().timestamp_millis(),
        };

        match self.entries.insert(message.topic.clone(), entry) {
            Some(_) => RetainOutcome::Replaced,
            None => RetainOutcome::Stored,
        }
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedEntry> {
        self.entries.get(topic)
    }

    /// Retained messages whose topic matches `filter`, ordered by topic.
    pub fn load_matching(&self, filter: &str) -> Vec<Message> {
        self.entries
            .values()
            .filter(|entry| topic::matches(&entry.topic, filter))
            .map(|entry| entry.message.clone())
            .collect()
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.entries.remove(topic).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RetainedStore {
    fn default() -> Self {
        Self::new(true)
    }
}

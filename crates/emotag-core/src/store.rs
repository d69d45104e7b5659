//! Per-topic history of tagged snapshots.
//!
//! Topics keep the spelling they were first filed under but match
//! case-insensitively, so "Holidays" and "holidays" share one history.
//! All access goes through a single mutex: appends, frozen copies and the
//! final drain never observe each other half-done.

use crate::types::{Snapshot, TaggedSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Everything filed under one topic, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct TopicHistory {
    pub topic: String,
    pub snapshots: Vec<TaggedSnapshot>,
}

impl TopicHistory {
    pub fn last(&self) -> Option<&TaggedSnapshot> {
        self.snapshots.last()
    }
}

/// A frozen copy of the store, ordered by case-folded topic.
pub type TopicMap = BTreeMap<String, TopicHistory>;

/// Normalize caller input: trimmed, and `None` when blank.
pub fn normalize_topic(topic: Option<&str>) -> Option<&str> {
    topic.map(str::trim).filter(|t| !t.is_empty())
}

fn topic_key(topic: &str) -> String {
    topic.to_lowercase()
}

#[derive(Default)]
pub struct TopicStore {
    inner: Mutex<TopicMap>,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TopicMap> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every mutation is a single push or insert.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// File `snapshot` under `topic`.
    ///
    /// Returns the topic's display name (its first spelling) and how many
    /// snapshots it now holds. `topic` must already be normalized (non-blank).
    pub fn append(&self, topic: &str, snapshot: &Snapshot) -> (String, usize) {
        let mut map = self.lock();
        let history = map
            .entry(topic_key(topic))
            .or_insert_with(|| TopicHistory {
                topic: topic.to_string(),
                snapshots: Vec::new(),
            });
        // Stamp with the canonical spelling so a topic's history is uniform.
        let tagged = TaggedSnapshot::new(snapshot, &history.topic);
        history.snapshots.push(tagged);
        (history.topic.clone(), history.snapshots.len())
    }

    /// Copy of the whole map, taken under the lock.
    pub fn frozen(&self) -> TopicMap {
        self.lock().clone()
    }

    /// Take everything, leaving the store empty.
    pub fn drain(&self) -> TopicMap {
        std::mem::take(&mut *self.lock())
    }

    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }

    pub fn history_len(&self, topic: &str) -> usize {
        self.lock()
            .get(&topic_key(topic))
            .map_or(0, |h| h.snapshots.len())
    }
}

/// Re-key a frozen map by display name, for callers that want `topic → history`.
pub fn by_display_name(map: TopicMap) -> BTreeMap<String, Vec<TaggedSnapshot>> {
    map.into_values().map(|h| (h.topic, h.snapshots)).collect()
}

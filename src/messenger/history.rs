//! Versioned per-channel property cache
//!
//! Every `set_property` starts a new history id for its (channel, key).
//! Older histories stay readable while something still references them, so
//! a frame can carry the exact property values that were current when it was
//! published.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{CoreError, Result};

/// Property key to history id, as returned by
/// [`PropertyHistoryBook::reference_current_properties`]
pub type PropertySnapshot = BTreeMap<String, u32>;

struct History {
    referenced: u32,
    data: Arc<[u8]>,
}

struct KeyHistories {
    current: u32,
    histories: BTreeMap<u32, History>,
    last_access: HashMap<String, u32>,
}

impl KeyHistories {
    fn release(&mut self, key: &str, history_id: u32) {
        if let Some(history) = self.histories.get_mut(&history_id) {
            history.referenced = history.referenced.saturating_sub(1);
            trace!(key, history_id, referenced = history.referenced, "Property history released");
            if history.referenced == 0 {
                self.histories.remove(&history_id);
            }
        }
    }
}

/// Serialized channel properties with per-key version history
#[derive(Default)]
pub struct PropertyHistoryBook {
    channels: Mutex<BTreeMap<u32, BTreeMap<String, KeyHistories>>>,
}

impl PropertyHistoryBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value for `key` on `channel_id`
    pub fn set_property(&self, channel_id: u32, key: &str, property: &[u8]) {
        let mut channels = self.channels.lock();
        let properties = channels.entry(channel_id).or_default();
        let history = History { referenced: 1, data: Arc::from(property) };

        match properties.get_mut(key) {
            Some(histories) => {
                // drop the book's own reference on the superseded value
                let previous = histories.current;
                histories.release(key, previous);
                histories.current += 1;
                histories.histories.insert(histories.current, history);
                trace!(channel_id, key, history_id = histories.current, "Property updated");
            }
            None => {
                let mut histories = KeyHistories {
                    current: 1,
                    histories: BTreeMap::new(),
                    last_access: HashMap::new(),
                };
                histories.histories.insert(1, history);
                properties.insert(key.to_string(), histories);
                trace!(channel_id, key, history_id = 1, "Property added");
            }
        }
    }

    /// Read one historical value
    pub fn get_property(&self, channel_id: u32, key: &str, history_id: u32) -> Result<Arc<[u8]>> {
        let channels = self.channels.lock();
        channels
            .get(&channel_id)
            .and_then(|properties| properties.get(key))
            .and_then(|histories| histories.histories.get(&history_id))
            .map(|history| Arc::clone(&history.data))
            .ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "unknown history: ch={}, key={}, id={}",
                    channel_id, key, history_id
                ))
            })
    }

    /// Take a reference on every current value of `channel_id`
    ///
    /// The returned snapshot must be handed back to
    /// [`release_properties`](Self::release_properties).
    pub fn reference_current_properties(&self, channel_id: u32) -> PropertySnapshot {
        let mut channels = self.channels.lock();
        let mut snapshot = PropertySnapshot::new();
        if let Some(properties) = channels.get_mut(&channel_id) {
            for (key, histories) in properties.iter_mut() {
                let current = histories.current;
                if let Some(history) = histories.histories.get_mut(&current) {
                    history.referenced += 1;
                    snapshot.insert(key.clone(), current);
                }
            }
        }
        snapshot
    }

    /// Drop references taken by [`reference_current_properties`](Self::reference_current_properties)
    pub fn release_properties(&self, channel_id: u32, snapshot: &PropertySnapshot) {
        let mut channels = self.channels.lock();
        let Some(properties) = channels.get_mut(&channel_id) else {
            return;
        };
        for (key, history_id) in snapshot {
            if let Some(histories) = properties.get_mut(key) {
                histories.release(key, *history_id);
            }
        }
    }

    /// Keys of `channel_id` whose value changed since `viewer` last asked
    ///
    /// The first call for a viewer reports every key.
    pub fn updated_property_list(&self, viewer: &str, channel_id: u32) -> Vec<String> {
        let mut channels = self.channels.lock();
        let mut updated = Vec::new();
        if let Some(properties) = channels.get_mut(&channel_id) {
            for (key, histories) in properties.iter_mut() {
                let current = histories.current;
                match histories.last_access.get_mut(viewer) {
                    Some(seen) if *seen >= current => {}
                    Some(seen) => {
                        *seen = current;
                        updated.push(key.clone());
                    }
                    None => {
                        histories.last_access.insert(viewer.to_string(), current);
                        updated.push(key.clone());
                    }
                }
            }
        }
        updated
    }

    /// Forget what `viewer` has seen
    pub fn remove_viewer(&self, viewer: &str) {
        let mut channels = self.channels.lock();
        for properties in channels.values_mut() {
            for histories in properties.values_mut() {
                histories.last_access.remove(viewer);
            }
        }
    }

    /// Number of live histories for a key (current value plus referenced ones)
    pub fn history_count(&self, channel_id: u32, key: &str) -> usize {
        self.channels
            .lock()
            .get(&channel_id)
            .and_then(|properties| properties.get(key))
            .map(|histories| histories.histories.len())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PropertyHistoryBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock();
        f.debug_struct("PropertyHistoryBook").field("channels", &channels.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cause;

    #[test]
    fn referenced_history_survives_updates() {
        let book = PropertyHistoryBook::new();
        book.set_property(0, "exposure", b"10");
        let snapshot = book.reference_current_properties(0);
        assert_eq!(snapshot.get("exposure"), Some(&1));

        book.set_property(0, "exposure", b"20");
        assert_eq!(&*book.get_property(0, "exposure", 1).unwrap(), b"10");
        assert_eq!(&*book.get_property(0, "exposure", 2).unwrap(), b"20");
        assert_eq!(book.history_count(0, "exposure"), 2);

        book.release_properties(0, &snapshot);
        assert_eq!(book.history_count(0, "exposure"), 1);
        let err = book.get_property(0, "exposure", 1).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidArgument);
    }

    #[test]
    fn unreferenced_history_is_dropped_on_update() {
        let book = PropertyHistoryBook::new();
        book.set_property(1, "gain", b"a");
        book.set_property(1, "gain", b"b");
        book.set_property(1, "gain", b"c");
        assert_eq!(book.history_count(1, "gain"), 1);
        assert_eq!(&*book.get_property(1, "gain", 3).unwrap(), b"c");
    }

    #[test]
    fn updated_list_tracks_each_viewer() {
        let book = PropertyHistoryBook::new();
        book.set_property(0, "exposure", b"1");
        book.set_property(0, "gain", b"1");

        assert_eq!(book.updated_property_list("a", 0), vec!["exposure", "gain"]);
        assert!(book.updated_property_list("a", 0).is_empty());

        book.set_property(0, "gain", b"2");
        assert_eq!(book.updated_property_list("a", 0), vec!["gain"]);
        assert_eq!(book.updated_property_list("b", 0), vec!["exposure", "gain"]);

        book.remove_viewer("a");
        assert_eq!(book.updated_property_list("a", 0).len(), 2);
    }

    #[test]
    fn unknown_channel_yields_empty_snapshot() {
        let book = PropertyHistoryBook::new();
        assert!(book.reference_current_properties(7).is_empty());
        assert!(book.updated_property_list("a", 7).is_empty());
        book.release_properties(7, &PropertySnapshot::new());
    }
}

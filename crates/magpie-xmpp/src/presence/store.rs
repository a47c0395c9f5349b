//! Presence state tables.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use crate::stanza::Stanza;
use crate::util::jid_to_bare;

/// Available-presence and directed-presence tables.
///
/// Written only by the presence engine; read by the router (resource
/// selection), the roster engine (presence rebroadcast on `subscribed`)
/// and the archive (offline detection).
pub struct PresenceStore {
    /// bare JID → full JID → last available presence
    presences: DashMap<String, HashMap<String, Stanza>>,
    /// full JID → set of directed-presence targets; keyed per (from, to)
    /// pair so an error from one target cannot erase another's entry
    directed: DashMap<String, HashSet<String>>,
}

impl PresenceStore {
    /// Create empty tables.
    pub fn new() -> Self {
        Self {
            presences: DashMap::new(),
            directed: DashMap::new(),
        }
    }

    /// Record an available presence. Returns true if this was the initial
    /// available presence for the full JID.
    pub fn record_available(&self, full_jid: &str, presence: Stanza) -> bool {
        let bare = jid_to_bare(full_jid).to_string();
        let mut entry = self.presences.entry(bare).or_default();
        entry.insert(full_jid.to_string(), presence).is_none()
    }

    /// Remove the available presence of a full JID. Returns whether an
    /// entry existed.
    pub fn remove_available(&self, full_jid: &str) -> bool {
        let bare = jid_to_bare(full_jid).to_string();
        let mut removed = false;
        if let Some(mut entry) = self.presences.get_mut(&bare) {
            removed = entry.remove(full_jid).is_some();
            if entry.is_empty() {
                drop(entry);
                self.presences.remove(&bare);
            }
        }
        removed
    }

    /// Whether a full JID has sent an available presence.
    pub fn has_available(&self, full_jid: &str) -> bool {
        self.presences
            .get(jid_to_bare(full_jid))
            .map(|entry| entry.contains_key(full_jid))
            .unwrap_or(false)
    }

    /// Last known presences of every resource of a bare JID.
    pub fn available_presences(&self, bare_jid: &str) -> Vec<Stanza> {
        self.presences
            .get(bare_jid)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Priority of a resource's last presence, if one is recorded.
    pub fn priority_of(&self, full_jid: &str) -> Option<i8> {
        self.presences
            .get(jid_to_bare(full_jid))
            .and_then(|entry| entry.get(full_jid).map(|p| p.priority()))
    }

    /// Record a directed presence target.
    pub fn directed_insert(&self, from_full: &str, to: &str) {
        self.directed
            .entry(from_full.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Remove one directed presence target pair.
    pub fn directed_remove(&self, from_full: &str, to: &str) {
        if let Some(mut entry) = self.directed.get_mut(from_full) {
            entry.remove(to);
            if entry.is_empty() {
                drop(entry);
                self.directed.remove(from_full);
            }
        }
    }

    /// Directed targets of a full JID.
    pub fn directed_targets(&self, from_full: &str) -> HashSet<String> {
        self.directed
            .get(from_full)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Remove and return every directed target of a full JID.
    pub fn directed_take_all(&self, from_full: &str) -> HashSet<String> {
        self.directed
            .remove(from_full)
            .map(|(_, targets)| targets)
            .unwrap_or_default()
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(from: &str) -> Stanza {
        let mut presence = Stanza::presence();
        presence.set_from(from);
        presence
    }

    #[test]
    fn initial_presence_detection() {
        let store = PresenceStore::new();
        assert!(store.record_available("a@x.com/r", available("a@x.com/r")));
        assert!(!store.record_available("a@x.com/r", available("a@x.com/r")));
        assert!(store.record_available("a@x.com/other", available("a@x.com/other")));
    }

    #[test]
    fn remove_clears_bare_entry() {
        let store = PresenceStore::new();
        store.record_available("a@x.com/r", available("a@x.com/r"));
        assert!(store.has_available("a@x.com/r"));
        assert!(store.remove_available("a@x.com/r"));
        assert!(!store.has_available("a@x.com/r"));
        assert!(!store.remove_available("a@x.com/r"));
        assert!(store.available_presences("a@x.com").is_empty());
    }

    #[test]
    fn directed_pairs_are_independent() {
        let store = PresenceStore::new();
        store.directed_insert("a@x.com/r", "room@conf.y.com/nick");
        store.directed_insert("a@x.com/r", "b@y.com");
        store.directed_remove("a@x.com/r", "b@y.com");
        let targets = store.directed_targets("a@x.com/r");
        assert_eq!(targets.len(), 1);
        assert!(targets.contains("room@conf.y.com/nick"));

        let drained = store.directed_take_all("a@x.com/r");
        assert_eq!(drained.len(), 1);
        assert!(store.directed_targets("a@x.com/r").is_empty());
    }
}

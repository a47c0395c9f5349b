//! Storage contract.
//!
//! The core assumes an ordered, indexed CRUD backend and nothing more.
//! Persistence engine internals live behind this trait; [`MemoryStorage`]
//! is the reference backend used by tests and small deployments.
//! Transactions are not required: the MUC affiliation batch relies on
//! in-memory room state and persists lazily.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::archive::{ChatCollectionRecord, ChatMessageRecord, OfflineMessageRecord};
use crate::error::XmppError;
use crate::muc::{AffiliationRecord, RoomRecord};
use crate::roster::RosterContact;

/// Persistence backend for the server's durable state.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // Roster

    /// All contacts of an owner, ordered by peer JID.
    async fn roster_contacts(&self, owner: &str) -> Result<Vec<RosterContact>, XmppError>;

    /// A single contact, if present.
    async fn roster_contact(
        &self,
        owner: &str,
        peer: &str,
    ) -> Result<Option<RosterContact>, XmppError>;

    /// Insert or update a contact keyed by (owner, peer).
    async fn upsert_roster_contact(&self, contact: &RosterContact) -> Result<(), XmppError>;

    /// Delete a contact. Returns whether it existed.
    async fn remove_roster_contact(&self, owner: &str, peer: &str) -> Result<bool, XmppError>;

    /// Contacts representing pending inbound subscription requests
    /// (ask includes From, no subscription yet), across all owners.
    async fn pending_subscription_requests(&self) -> Result<Vec<RosterContact>, XmppError>;

    // MUC

    /// All persistent rooms.
    async fn muc_rooms(&self) -> Result<Vec<RoomRecord>, XmppError>;

    /// Affiliations of a room.
    async fn muc_affiliations(&self, room: &str) -> Result<Vec<AffiliationRecord>, XmppError>;

    /// Insert or update a room row.
    async fn save_muc_room(&self, room: &RoomRecord) -> Result<(), XmppError>;

    /// Delete a room row.
    async fn delete_muc_room(&self, room: &str) -> Result<(), XmppError>;

    /// Insert or update an affiliation row keyed by (room, jid).
    async fn save_muc_affiliation(&self, record: &AffiliationRecord) -> Result<(), XmppError>;

    /// Delete one affiliation row.
    async fn delete_muc_affiliation(&self, room: &str, jid: &str) -> Result<(), XmppError>;

    /// Delete every affiliation row of a room.
    async fn delete_muc_affiliations(&self, room: &str) -> Result<(), XmppError>;

    // Archive

    /// Id and date of the most recent message between two bare JIDs.
    async fn latest_chat_message(
        &self,
        owner: &str,
        with: &str,
    ) -> Result<Option<(i64, DateTime<Utc>)>, XmppError>;

    /// Create a new chat collection; returns its id.
    async fn create_chat_collection(
        &self,
        owner: &str,
        with: &str,
        start: DateTime<Utc>,
    ) -> Result<i64, XmppError>;

    /// Append a message to a collection; returns the message id.
    async fn append_chat_message(
        &self,
        chat_id: i64,
        body: &str,
        date: DateTime<Utc>,
        received: bool,
    ) -> Result<i64, XmppError>;

    /// Collections of an owner ordered by start time, optionally filtered
    /// by peer and by a date range applied to the start time on both ends.
    async fn chat_collections(
        &self,
        owner: &str,
        with: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatCollectionRecord>, XmppError>;

    /// Look up a collection by its exact start time.
    async fn chat_collection_by_start(
        &self,
        owner: &str,
        with: Option<&str>,
        start: DateTime<Utc>,
    ) -> Result<Option<ChatCollectionRecord>, XmppError>;

    /// Messages of a collection ordered by date.
    async fn chat_messages(&self, chat_id: i64) -> Result<Vec<ChatMessageRecord>, XmppError>;

    /// Remove collections and their messages. Returns the number of
    /// collections removed.
    async fn remove_chat_collections(&self, ids: &[i64]) -> Result<usize, XmppError>;

    // Offline queue

    /// Queue a serialized stanza for a recipient; returns the row id.
    async fn push_offline_message(
        &self,
        jid: &str,
        data: &str,
        stamp: DateTime<Utc>,
    ) -> Result<i64, XmppError>;

    /// Queued stanzas for a recipient in insertion order.
    async fn offline_messages(&self, jid: &str) -> Result<Vec<OfflineMessageRecord>, XmppError>;

    /// Remove one queued stanza.
    async fn remove_offline_message(&self, id: i64) -> Result<(), XmppError>;

    // Private XML storage

    /// Stored payload for (bare JID, namespace).
    async fn private_xml(&self, jid: &str, namespace: &str) -> Result<Option<String>, XmppError>;

    /// Upsert a payload keyed by (bare JID, namespace).
    async fn set_private_xml(
        &self,
        jid: &str,
        namespace: &str,
        xml: &str,
    ) -> Result<(), XmppError>;

    // vCards

    /// Stored vCard for a bare JID.
    async fn vcard(&self, jid: &str) -> Result<Option<String>, XmppError>;

    /// Upsert the vCard of a bare JID.
    async fn set_vcard(&self, jid: &str, xml: &str) -> Result<(), XmppError>;
}

#[derive(Default)]
struct MemoryState {
    contacts: HashMap<(String, String), RosterContact>,
    rooms: HashMap<String, RoomRecord>,
    affiliations: HashMap<(String, String), AffiliationRecord>,
    chats: Vec<ChatCollectionRecord>,
    messages: Vec<ChatMessageRecord>,
    offline: Vec<OfflineMessageRecord>,
    private_xml: HashMap<(String, String), String>,
    vcards: HashMap<String, String>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory storage backend.
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a poisoned lock means a panic mid-update; propagating the panic
        // is the only sensible option for an in-memory store
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn roster_contacts(&self, owner: &str) -> Result<Vec<RosterContact>, XmppError> {
        let state = self.lock();
        let mut contacts: Vec<RosterContact> = state
            .contacts
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| a.jid.cmp(&b.jid));
        Ok(contacts)
    }

    async fn roster_contact(
        &self,
        owner: &str,
        peer: &str,
    ) -> Result<Option<RosterContact>, XmppError> {
        let state = self.lock();
        Ok(state
            .contacts
            .get(&(owner.to_string(), peer.to_string()))
            .cloned())
    }

    async fn upsert_roster_contact(&self, contact: &RosterContact) -> Result<(), XmppError> {
        let mut state = self.lock();
        state
            .contacts
            .insert((contact.owner.clone(), contact.jid.clone()), contact.clone());
        Ok(())
    }

    async fn remove_roster_contact(&self, owner: &str, peer: &str) -> Result<bool, XmppError> {
        let mut state = self.lock();
        Ok(state
            .contacts
            .remove(&(owner.to_string(), peer.to_string()))
            .is_some())
    }

    async fn pending_subscription_requests(&self) -> Result<Vec<RosterContact>, XmppError> {
        let state = self.lock();
        let mut pending: Vec<RosterContact> = state
            .contacts
            .values()
            .filter(|c| c.ask.has_from() && c.subscription.is_empty())
            .cloned()
            .collect();
        pending.sort_by(|a, b| (&a.owner, &a.jid).cmp(&(&b.owner, &b.jid)));
        Ok(pending)
    }

    async fn muc_rooms(&self) -> Result<Vec<RoomRecord>, XmppError> {
        let state = self.lock();
        let mut rooms: Vec<RoomRecord> = state.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| a.jid.cmp(&b.jid));
        Ok(rooms)
    }

    async fn muc_affiliations(&self, room: &str) -> Result<Vec<AffiliationRecord>, XmppError> {
        let state = self.lock();
        let mut records: Vec<AffiliationRecord> = state
            .affiliations
            .values()
            .filter(|a| a.room == room)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.jid.cmp(&b.jid));
        Ok(records)
    }

    async fn save_muc_room(&self, room: &RoomRecord) -> Result<(), XmppError> {
        let mut state = self.lock();
        state.rooms.insert(room.jid.clone(), room.clone());
        Ok(())
    }

    async fn delete_muc_room(&self, room: &str) -> Result<(), XmppError> {
        let mut state = self.lock();
        state.rooms.remove(room);
        Ok(())
    }

    async fn save_muc_affiliation(&self, record: &AffiliationRecord) -> Result<(), XmppError> {
        let mut state = self.lock();
        state
            .affiliations
            .insert((record.room.clone(), record.jid.clone()), record.clone());
        Ok(())
    }

    async fn delete_muc_affiliation(&self, room: &str, jid: &str) -> Result<(), XmppError> {
        let mut state = self.lock();
        state
            .affiliations
            .remove(&(room.to_string(), jid.to_string()));
        Ok(())
    }

    async fn delete_muc_affiliations(&self, room: &str) -> Result<(), XmppError> {
        let mut state = self.lock();
        state.affiliations.retain(|(r, _), _| r != room);
        Ok(())
    }

    async fn latest_chat_message(
        &self,
        owner: &str,
        with: &str,
    ) -> Result<Option<(i64, DateTime<Utc>)>, XmppError> {
        let state = self.lock();
        let chat_ids: Vec<i64> = state
            .chats
            .iter()
            .filter(|c| c.owner == owner && c.with == with)
            .map(|c| c.id)
            .collect();
        Ok(state
            .messages
            .iter()
            .filter(|m| chat_ids.contains(&m.chat_id))
            .max_by_key(|m| (m.date, m.id))
            .map(|m| (m.chat_id, m.date)))
    }

    async fn create_chat_collection(
        &self,
        owner: &str,
        with: &str,
        start: DateTime<Utc>,
    ) -> Result<i64, XmppError> {
        let mut state = self.lock();
        let id = state.next_id();
        state.chats.push(ChatCollectionRecord {
            id,
            owner: owner.to_string(),
            with: with.to_string(),
            start,
        });
        Ok(id)
    }

    async fn append_chat_message(
        &self,
        chat_id: i64,
        body: &str,
        date: DateTime<Utc>,
        received: bool,
    ) -> Result<i64, XmppError> {
        let mut state = self.lock();
        let id = state.next_id();
        state.messages.push(ChatMessageRecord {
            id,
            chat_id,
            body: body.to_string(),
            date,
            received,
        });
        Ok(id)
    }

    async fn chat_collections(
        &self,
        owner: &str,
        with: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatCollectionRecord>, XmppError> {
        let state = self.lock();
        let mut chats: Vec<ChatCollectionRecord> = state
            .chats
            .iter()
            .filter(|c| c.owner == owner)
            .filter(|c| with.map_or(true, |w| c.with == w))
            .filter(|c| from.map_or(true, |f| c.start >= f))
            .filter(|c| to.map_or(true, |t| c.start <= t))
            .cloned()
            .collect();
        chats.sort_by_key(|c| (c.start, c.id));
        Ok(chats)
    }

    async fn chat_collection_by_start(
        &self,
        owner: &str,
        with: Option<&str>,
        start: DateTime<Utc>,
    ) -> Result<Option<ChatCollectionRecord>, XmppError> {
        let state = self.lock();
        Ok(state
            .chats
            .iter()
            .find(|c| {
                c.owner == owner && c.start == start && with.map_or(true, |w| c.with == w)
            })
            .cloned())
    }

    async fn chat_messages(&self, chat_id: i64) -> Result<Vec<ChatMessageRecord>, XmppError> {
        let state = self.lock();
        let mut messages: Vec<ChatMessageRecord> = state
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.date, m.id));
        Ok(messages)
    }

    async fn remove_chat_collections(&self, ids: &[i64]) -> Result<usize, XmppError> {
        let mut state = self.lock();
        let before = state.chats.len();
        state.chats.retain(|c| !ids.contains(&c.id));
        state.messages.retain(|m| !ids.contains(&m.chat_id));
        Ok(before - state.chats.len())
    }

    async fn push_offline_message(
        &self,
        jid: &str,
        data: &str,
        stamp: DateTime<Utc>,
    ) -> Result<i64, XmppError> {
        let mut state = self.lock();
        let id = state.next_id();
        state.offline.push(OfflineMessageRecord {
            id,
            jid: jid.to_string(),
            data: data.to_string(),
            stamp,
        });
        Ok(id)
    }

    async fn offline_messages(&self, jid: &str) -> Result<Vec<OfflineMessageRecord>, XmppError> {
        let state = self.lock();
        Ok(state
            .offline
            .iter()
            .filter(|m| m.jid == jid)
            .cloned()
            .collect())
    }

    async fn remove_offline_message(&self, id: i64) -> Result<(), XmppError> {
        let mut state = self.lock();
        state.offline.retain(|m| m.id != id);
        Ok(())
    }

    async fn private_xml(&self, jid: &str, namespace: &str) -> Result<Option<String>, XmppError> {
        let state = self.lock();
        Ok(state
            .private_xml
            .get(&(jid.to_string(), namespace.to_string()))
            .cloned())
    }

    async fn set_private_xml(
        &self,
        jid: &str,
        namespace: &str,
        xml: &str,
    ) -> Result<(), XmppError> {
        let mut state = self.lock();
        state
            .private_xml
            .insert((jid.to_string(), namespace.to_string()), xml.to_string());
        Ok(())
    }

    async fn vcard(&self, jid: &str) -> Result<Option<String>, XmppError> {
        let state = self.lock();
        Ok(state.vcards.get(jid).cloned())
    }

    async fn set_vcard(&self, jid: &str, xml: &str) -> Result<(), XmppError> {
        let mut state = self.lock();
        state.vcards.insert(jid.to_string(), xml.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::SubscriptionBits;

    #[tokio::test]
    async fn roster_round_trip() {
        let storage = MemoryStorage::new();
        let mut contact = RosterContact::new("alice@x.com", "bob@x.com");
        contact.subscription = SubscriptionBits::FROM;
        storage.upsert_roster_contact(&contact).await.unwrap();

        let found = storage
            .roster_contact("alice@x.com", "bob@x.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.subscription, SubscriptionBits::FROM);

        assert!(storage
            .remove_roster_contact("alice@x.com", "bob@x.com")
            .await
            .unwrap());
        assert!(!storage
            .remove_roster_contact("alice@x.com", "bob@x.com")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn offline_queue_preserves_insertion_order() {
        let storage = MemoryStorage::new();
        let now = Utc::now();
        storage
            .push_offline_message("bob@x.com", "<message/>", now)
            .await
            .unwrap();
        storage
            .push_offline_message("bob@x.com", "<message2/>", now)
            .await
            .unwrap();
        storage
            .push_offline_message("eve@x.com", "<other/>", now)
            .await
            .unwrap();

        let queued = storage.offline_messages("bob@x.com").await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].data, "<message/>");
        assert_eq!(queued[1].data, "<message2/>");

        storage.remove_offline_message(queued[0].id).await.unwrap();
        assert_eq!(storage.offline_messages("bob@x.com").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chat_collections_filter_on_start() {
        let storage = MemoryStorage::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5000);
        storage
            .create_chat_collection("a@x.com", "b@x.com", t0)
            .await
            .unwrap();
        storage
            .create_chat_collection("a@x.com", "b@x.com", t1)
            .await
            .unwrap();

        let all = storage
            .chat_collections("a@x.com", None, None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].start <= all[1].start);

        let ranged = storage
            .chat_collections("a@x.com", None, Some(t1), None)
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
    }
}

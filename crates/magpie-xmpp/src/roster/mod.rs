//! Roster engine (RFC 6121 contact lists and the subscription state
//! machine).
//!
//! A contact carries two independent bit sets over {To, From}: the granted
//! `subscription` and the pending `ask`. Inbound subscription requests from
//! unknown peers create a *hidden* contact so the request survives the
//! owner's reconnection; hidden contacts never appear in roster gets but
//! participate fully in the state machine.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::storage::Storage;
use crate::util::{jid_to_bare, jid_to_domain};

/// Subscription direction bits.
///
/// `TO` means the owner (asked to) receive(s) the peer's presence; `FROM`
/// means the peer receives the owner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionBits(u8);

impl SubscriptionBits {
    /// Neither direction.
    pub const NONE: Self = Self(0);
    /// Owner subscribes to peer.
    pub const TO: Self = Self(1);
    /// Peer subscribes to owner.
    pub const FROM: Self = Self(2);
    /// Both directions.
    pub const BOTH: Self = Self(3);

    /// Whether any of the given bits are set.
    pub fn has(self, bits: Self) -> bool {
        self.0 & bits.0 != 0
    }

    /// Whether the To bit is set.
    pub fn has_to(self) -> bool {
        self.has(Self::TO)
    }

    /// Whether the From bit is set.
    pub fn has_from(self) -> bool {
        self.has(Self::FROM)
    }

    /// Set bits.
    pub fn insert(&mut self, bits: Self) {
        self.0 |= bits.0;
    }

    /// Clear bits.
    pub fn remove(&mut self, bits: Self) {
        self.0 &= !bits.0;
    }

    /// No bits set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Roster `subscription` attribute value.
    pub fn as_str(self) -> &'static str {
        match self.0 {
            1 => "to",
            2 => "from",
            3 => "both",
            _ => "none",
        }
    }

    /// Parse a roster `subscription` attribute value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::NONE),
            "to" => Some(Self::TO),
            "from" => Some(Self::FROM),
            "both" => Some(Self::BOTH),
            _ => None,
        }
    }
}

/// A roster contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterContact {
    /// Owner bare JID.
    pub owner: String,
    /// Peer bare JID.
    pub jid: String,
    /// Display name, may be empty.
    pub name: String,
    /// Group memberships.
    pub groups: BTreeSet<String>,
    /// Granted subscription directions.
    pub subscription: SubscriptionBits,
    /// Pending subscription directions.
    pub ask: SubscriptionBits,
    /// Hidden contacts hold inbound requests and are omitted from gets.
    pub hidden: bool,
}

impl RosterContact {
    /// Create an empty contact.
    pub fn new(owner: &str, jid: &str) -> Self {
        Self {
            owner: owner.to_string(),
            jid: jid.to_string(),
            name: String::new(),
            groups: BTreeSet::new(),
            subscription: SubscriptionBits::NONE,
            ask: SubscriptionBits::NONE,
            hidden: false,
        }
    }

    /// Whether a direction is granted or pending.
    pub fn has_subscription(&self, bits: SubscriptionBits) -> bool {
        self.ask.has(bits) || self.subscription.has(bits)
    }

    /// A contact with no state left must not exist.
    pub fn is_empty_state(&self) -> bool {
        self.subscription.is_empty() && self.ask.is_empty() && !self.hidden
    }

    /// Roster item element for gets and pushes.
    pub fn to_item_element(&self) -> Element {
        let mut item = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.as_str())
            .attr("subscription", self.subscription.as_str());
        if !self.name.is_empty() {
            item = item.attr("name", self.name.as_str());
        }
        if self.ask.has_to() {
            item = item.attr("ask", "subscribe");
        }
        for group in &self.groups {
            item = item.append(
                Element::builder("group", ns::ROSTER)
                    .append(group.as_str())
                    .build(),
            );
        }
        item.build()
    }
}

/// The roster extension.
pub struct RosterExtension {
    /// Full JIDs that connected but have not fetched their roster yet;
    /// queued subscribe presences are flushed on the first get.
    connected: DashMap<String, ()>,
}

impl RosterExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self {
            connected: DashMap::new(),
        }
    }

    /// Persist a contact, or delete it when it reached the empty state.
    async fn save_or_gc(&self, server: &Server, contact: &RosterContact) -> Result<(), XmppError> {
        if contact.is_empty_state() {
            server
                .storage()
                .remove_roster_contact(&contact.owner, &contact.jid)
                .await?;
        } else {
            server.storage().upsert_roster_contact(contact).await?;
        }
        Ok(())
    }

    /// Push a contact to every live resource of its owner.
    async fn push_contact(&self, server: &Server, contact: &RosterContact) {
        let mut push = Stanza::iq("set", &Uuid::new_v4().to_string());
        push.append(
            Element::builder("query", ns::ROSTER)
                .append(contact.to_item_element())
                .build(),
        );
        for resource in server.sessions().resources_for(&contact.owner) {
            let mut copy = push.clone();
            copy.set_to(&resource);
            server.send_packet(copy).await;
        }
    }

    async fn get_contact(
        &self,
        server: &Server,
        owner_jid: &str,
        peer_jid: &str,
    ) -> Result<(RosterContact, bool), XmppError> {
        let owner = jid_to_bare(owner_jid);
        let peer = jid_to_bare(peer_jid);
        match server.storage().roster_contact(owner, peer).await? {
            Some(contact) => Ok((contact, true)),
            None => Ok((RosterContact::new(owner, peer), false)),
        }
    }

    /// Handles a subscription presence TO a local user. Returns Consumed
    /// when the presence must not be routed to the user.
    async fn handle_inbound_presence(
        &self,
        server: &Server,
        presence: &Stanza,
    ) -> Result<Handled, XmppError> {
        let (mut contact, existed) = self
            .get_contact(server, presence.to(), presence.from())
            .await?;

        match presence.type_attr() {
            "subscribe" => {
                // already subscribed, drop the duplicate request
                if contact.has_subscription(SubscriptionBits::FROM) {
                    return Ok(Handled::Consumed);
                }
                contact.ask.insert(SubscriptionBits::FROM);
                contact.hidden = !existed;
                server.storage().upsert_roster_contact(&contact).await?;
            }
            "unsubscribe" => {
                if !contact.has_subscription(SubscriptionBits::FROM) {
                    return Ok(Handled::Consumed);
                }
                if contact.hidden {
                    server
                        .storage()
                        .remove_roster_contact(&contact.owner, &contact.jid)
                        .await?;
                } else {
                    contact.ask.remove(SubscriptionBits::FROM);
                    contact.subscription.remove(SubscriptionBits::FROM);
                    self.save_or_gc(server, &contact).await?;
                    self.push_contact(server, &contact).await;
                }
            }
            "subscribed" => {
                // only meaningful if we asked and are not yet subscribed
                if !contact.ask.has_to() || contact.subscription.has_to() {
                    return Ok(Handled::Consumed);
                }
                contact.ask.remove(SubscriptionBits::TO);
                contact.subscription.insert(SubscriptionBits::TO);
                server.storage().upsert_roster_contact(&contact).await?;
                self.push_contact(server, &contact).await;
            }
            "unsubscribed" => {
                if !contact.has_subscription(SubscriptionBits::TO) {
                    return Ok(Handled::Consumed);
                }
                contact.ask.remove(SubscriptionBits::TO);
                contact.subscription.remove(SubscriptionBits::TO);
                self.save_or_gc(server, &contact).await?;
                self.push_contact(server, &contact).await;
            }
            _ => {}
        }
        Ok(Handled::Pass)
    }

    /// State transitions and roster pushes for a subscription presence
    /// FROM a local user. Runs before the presence is relayed.
    async fn handle_outbound_presence(
        &self,
        server: &Server,
        presence: &Stanza,
    ) -> Result<(), XmppError> {
        let (mut contact, _) = self
            .get_contact(server, presence.from(), presence.to())
            .await?;

        match presence.type_attr() {
            "subscribe" => {
                if !contact.has_subscription(SubscriptionBits::TO) {
                    contact.ask.insert(SubscriptionBits::TO);
                    server.storage().upsert_roster_contact(&contact).await?;
                    self.push_contact(server, &contact).await;
                }
            }
            "unsubscribe" => {
                if contact.has_subscription(SubscriptionBits::TO) {
                    contact.ask.remove(SubscriptionBits::TO);
                    contact.subscription.remove(SubscriptionBits::TO);
                    self.save_or_gc(server, &contact).await?;
                    self.push_contact(server, &contact).await;
                }
            }
            "subscribed" => {
                contact.ask.remove(SubscriptionBits::FROM);
                contact.subscription.insert(SubscriptionBits::FROM);
                contact.hidden = false;
                server.storage().upsert_roster_contact(&contact).await?;
                self.push_contact(server, &contact).await;
            }
            "unsubscribed" => {
                if contact.has_subscription(SubscriptionBits::FROM) {
                    if contact.hidden {
                        server
                            .storage()
                            .remove_roster_contact(&contact.owner, &contact.jid)
                            .await?;
                    } else {
                        contact.ask.remove(SubscriptionBits::FROM);
                        contact.subscription.remove(SubscriptionBits::FROM);
                        self.save_or_gc(server, &contact).await?;
                        self.push_contact(server, &contact).await;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Presence side effects of an outbound subscription change, emitted
    /// after the subscription presence itself was relayed.
    async fn replay_presences_after_outbound(&self, server: &Server, presence: &Stanza) {
        let owner_bare = jid_to_bare(presence.from()).to_string();
        let peer = jid_to_bare(presence.to()).to_string();

        match presence.type_attr() {
            "subscribed" => {
                // the peer may now see us: replay our presences
                for mut available in server.presence().available_presences(&owner_bare) {
                    available.set_to(&peer);
                    server.send_packet(available).await;
                }
            }
            "unsubscribed" => {
                // the peer may no longer see us
                for available in server.presence().available_presences(&owner_bare) {
                    let mut unavailable = Stanza::presence_type("unavailable");
                    unavailable.set_from(available.from());
                    unavailable.set_to(&peer);
                    server.send_packet(unavailable).await;
                }
            }
            _ => {}
        }
    }

    async fn handle_roster_get(
        &self,
        server: &Server,
        stanza: &Stanza,
    ) -> Result<(), XmppError> {
        let from = stanza.from().to_string();
        let owner = jid_to_bare(&from);
        let contacts = server.storage().roster_contacts(owner).await?;

        let send_queued = self.connected.remove(&from).is_some();
        let mut queued = Vec::new();

        let mut query = Element::builder("query", ns::ROSTER);
        for contact in &contacts {
            if !contact.hidden {
                query = query.append(contact.to_item_element());
            }
            if send_queued && contact.ask.has_from() {
                let mut subscribe = Stanza::presence_type("subscribe");
                subscribe.set_from(&contact.jid);
                subscribe.set_to(&from);
                queued.push(subscribe);
            }
        }

        let mut response = stanza.result_for();
        response.append(query.build());
        server.send_packet(response).await;

        // deliver subscription requests that arrived while offline
        for subscribe in queued {
            server.send_packet(subscribe).await;
        }
        Ok(())
    }

    async fn handle_roster_set(
        &self,
        server: &Server,
        stanza: &Stanza,
        query: &Element,
    ) -> Result<(), XmppError> {
        let from = stanza.from().to_string();
        let owner = jid_to_bare(&from).to_string();
        let domain = server.domain().to_string();
        let mut removed_contacts: HashSet<String> = HashSet::new();
        let mut push_items: Vec<Element> = Vec::new();

        for item in query.children().filter(|c| c.name() == "item") {
            let Some(peer) = item.attr("jid") else {
                continue;
            };
            let peer = jid_to_bare(peer).to_string();
            let subscription = item.attr("subscription").unwrap_or("");
            let existing = server.storage().roster_contact(&owner, &peer).await?;

            if subscription == "remove" {
                let Some(contact) = existing else {
                    continue;
                };
                server.storage().remove_roster_contact(&owner, &peer).await?;
                push_items.push(item.clone());

                // retract both directions from the peer
                for presence_type in ["unsubscribe", "unsubscribed"] {
                    let mut presence = Stanza::presence_type(presence_type);
                    presence.set_from(&contact.owner);
                    presence.set_to(&contact.jid);
                    if jid_to_domain(&contact.jid) == domain {
                        self.handle_inbound_presence(server, &presence).await?;
                    }
                    server.send_packet(presence).await;
                }
                removed_contacts.insert(contact.jid);
            } else {
                let mut contact =
                    existing.unwrap_or_else(|| RosterContact::new(&owner, &peer));
                contact.groups = item
                    .children()
                    .filter(|c| c.name() == "group")
                    .map(|c| c.text())
                    .collect();
                contact.hidden = false;
                contact.name = item.attr("name").unwrap_or("").to_string();
                if let Some(bits) = SubscriptionBits::parse(subscription) {
                    contact.subscription = bits;
                }
                server.storage().upsert_roster_contact(&contact).await?;
                push_items.push(contact.to_item_element());
            }
        }

        // pushes go out before the result so an immediate re-read is
        // consistent
        let mut push = Stanza::iq("set", &Uuid::new_v4().to_string());
        let mut push_query = Element::builder("query", ns::ROSTER);
        for item in push_items {
            push_query = push_query.append(item);
        }
        push.append(push_query.build());
        for resource in server.sessions().resources_for(&owner) {
            let mut copy = push.clone();
            copy.set_to(&resource);
            server.send_packet(copy).await;
        }

        server.send_packet(stanza.result_for()).await;

        // removed peers stop seeing our presence
        for available in server.presence().available_presences(&owner) {
            for peer in &removed_contacts {
                let mut unavailable = Stanza::presence_type("unavailable");
                unavailable.set_from(available.from());
                unavailable.set_to(peer);
                server.send_packet(unavailable).await;
            }
        }
        Ok(())
    }
}

impl Default for RosterExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for RosterExtension {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::ROSTER.to_string()]
    }

    async fn presence_subscribers(&self, server: &Server, jid: &str) -> HashSet<String> {
        let mut subscribers = HashSet::new();
        if jid_to_domain(jid) != server.domain() {
            return subscribers;
        }
        match server.storage().roster_contacts(jid_to_bare(jid)).await {
            Ok(contacts) => {
                for contact in contacts {
                    if contact.subscription.has_from() {
                        subscribers.insert(contact.jid);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load subscribers"),
        }
        subscribers
    }

    async fn presence_subscriptions(&self, server: &Server, jid: &str) -> HashSet<String> {
        let mut subscriptions = HashSet::new();
        if jid_to_domain(jid) != server.domain() {
            return subscriptions;
        }
        match server.storage().roster_contacts(jid_to_bare(jid)).await {
            Ok(contacts) => {
                for contact in contacts {
                    if contact.subscription.has_to() {
                        subscriptions.insert(contact.jid);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load subscriptions"),
        }
        subscriptions
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        let domain = server.domain().to_string();
        let from = stanza.from().to_string();
        let to = stanza.to().to_string();

        if stanza.kind() == StanzaKind::Iq && to == domain {
            // only local users own rosters here
            if jid_to_domain(&from) != domain {
                return Ok(Handled::Pass);
            }
            let Some(query) = stanza.child("query", ns::ROSTER).cloned() else {
                return Ok(Handled::Pass);
            };
            let outcome = match stanza.type_attr() {
                "get" => self.handle_roster_get(server, stanza).await,
                "set" => self.handle_roster_set(server, stanza, &query).await,
                _ => return Ok(Handled::Consumed),
            };
            if let Err(e) = outcome {
                warn!(error = %e, from = %from, "roster query failed");
                let reply = stanza
                    .error_reply(StanzaErrorType::Wait, StanzaErrorCondition::ServiceUnavailable);
                server.send_packet(reply).await;
            }
            return Ok(Handled::Consumed);
        }

        if stanza.kind() == StanzaKind::Presence && to != domain {
            let presence_type = stanza.type_attr().to_string();

            // presence probes from remote subscribers
            if presence_type == "probe"
                && jid_to_domain(&to) == domain
                && jid_to_domain(&from) != domain
            {
                let (contact, existed) = self.get_contact(server, &to, &from).await?;
                if existed && contact.subscription.has_from() {
                    for mut available in
                        server.presence().available_presences(jid_to_bare(&to))
                    {
                        available.set_to(&from);
                        server.send_packet(available).await;
                    }
                }
                return Ok(Handled::Consumed);
            }

            if !matches!(
                presence_type.as_str(),
                "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed"
            ) {
                return Ok(Handled::Pass);
            }

            let from_local = jid_to_domain(&from) == domain;
            if from_local {
                self.handle_outbound_presence(server, stanza).await?;
                // the peer sees the owner's bare JID
                stanza.set_from(jid_to_bare(&from));
            }

            if jid_to_domain(&to) == domain {
                if self.handle_inbound_presence(server, stanza).await? == Handled::Consumed {
                    return Ok(Handled::Consumed);
                }
            }

            debug!(
                from = stanza.from(),
                to = %to,
                presence_type = %presence_type,
                "relaying subscription presence"
            );
            // the subscription presence reaches the peer before any
            // presence replays it unlocks
            server.send_packet(stanza.clone()).await;
            if from_local {
                self.replay_presences_after_outbound(server, stanza).await;
            }
            return Ok(Handled::Consumed);
        }
        Ok(Handled::Pass)
    }

    async fn client_connected(&self, _server: &Server, jid: &str) {
        self.connected.insert(jid.to_string(), ());
    }

    async fn client_disconnected(&self, _server: &Server, jid: &str) {
        self.connected.remove(jid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_bits() {
        let mut bits = SubscriptionBits::NONE;
        assert!(bits.is_empty());
        bits.insert(SubscriptionBits::TO);
        assert!(bits.has_to());
        assert!(!bits.has_from());
        assert_eq!(bits.as_str(), "to");
        bits.insert(SubscriptionBits::FROM);
        assert_eq!(bits.as_str(), "both");
        bits.remove(SubscriptionBits::TO);
        assert_eq!(bits.as_str(), "from");
        assert_eq!(SubscriptionBits::parse("both"), Some(SubscriptionBits::BOTH));
        assert_eq!(SubscriptionBits::parse("bogus"), None);
    }

    #[test]
    fn contact_empty_state() {
        let mut contact = RosterContact::new("a@x.com", "b@x.com");
        assert!(contact.is_empty_state());
        contact.hidden = true;
        assert!(!contact.is_empty_state());
        contact.hidden = false;
        contact.ask.insert(SubscriptionBits::FROM);
        assert!(!contact.is_empty_state());
    }

    #[test]
    fn item_element_shape() {
        let mut contact = RosterContact::new("a@x.com", "b@x.com");
        contact.name = "Bob".to_string();
        contact.subscription = SubscriptionBits::FROM;
        contact.ask = SubscriptionBits::TO;
        contact.groups.insert("Friends".to_string());

        let item = contact.to_item_element();
        assert_eq!(item.attr("jid"), Some("b@x.com"));
        assert_eq!(item.attr("subscription"), Some("from"));
        assert_eq!(item.attr("ask"), Some("subscribe"));
        assert_eq!(item.attr("name"), Some("Bob"));
        let groups: Vec<String> = item
            .children()
            .filter(|c| c.name() == "group")
            .map(|c| c.text())
            .collect();
        assert_eq!(groups, vec!["Friends".to_string()]);
    }

    #[test]
    fn has_subscription_counts_pending() {
        let mut contact = RosterContact::new("a@x.com", "b@x.com");
        contact.ask.insert(SubscriptionBits::TO);
        assert!(contact.has_subscription(SubscriptionBits::TO));
        assert!(!contact.has_subscription(SubscriptionBits::FROM));
        contact.subscription.insert(SubscriptionBits::FROM);
        assert!(contact.has_subscription(SubscriptionBits::FROM));
    }
}

//! Multi-user chat (XEP-0045).
//!
//! Rooms live in memory behind a coarse lock; persistent rooms and their
//! affiliations are additionally materialized through the storage
//! contract. Occupants are kept in a per-room arena with stable ids and
//! two lookup maps (real JID and room-nickname JID), so removal never
//! leaves a dangling reference.

mod admin;

use std::collections::{HashMap, VecDeque};
use std::sync::OnceLock;

use async_trait::async_trait;
use minidom::Element;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::storage::Storage;
use crate::types::{Affiliation, Role};
use crate::util::{jid_to_bare, jid_to_domain, jid_to_resource, jid_to_user};

/// Bounded room history size.
pub const HISTORY_LIMIT: usize = 20;

/// Body size above which a groupchat message is logged.
pub const LONG_MESSAGE_BYTES: usize = 256;

/// Body size above which a groupchat message is truncated.
pub const TRUNCATE_BYTES: usize = 1024;

/// Suffix appended to truncated bodies.
pub const TRUNCATE_MARKER: &str = " [truncated]";

/// A persistent room row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    /// Room bare JID (room@conference.domain).
    pub jid: String,
    /// Human-readable name.
    pub name: String,
    /// Only members may join.
    pub members_only: bool,
    /// Survives emptying and restarts.
    pub persistent: bool,
    /// Listed to everyone in discovery.
    pub public: bool,
}

/// A persistent affiliation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationRecord {
    /// Room bare JID.
    pub room: String,
    /// Affiliated bare JID.
    pub jid: String,
    /// Granted affiliation.
    pub affiliation: Affiliation,
}

/// MUC configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MucConfig {
    /// Component JID; defaults to `conference.<domain>`.
    #[serde(default)]
    pub jid: Option<String>,
    /// Server administrators, treated as Owner in every room.
    #[serde(default)]
    pub admins: Vec<String>,
}

/// An occupant of a room.
#[derive(Debug, Clone)]
pub struct Occupant {
    /// The client's real full JID.
    pub real_jid: String,
    /// The occupant's room address (room@service/nick).
    pub room_jid: String,
    /// Session role.
    pub role: Role,
}

/// Arena of occupants with stable ids and two lookup maps.
#[derive(Debug, Default)]
pub struct OccupantArena {
    slots: Vec<Option<Occupant>>,
    free: Vec<usize>,
    by_real: HashMap<String, usize>,
    by_nick: HashMap<String, usize>,
}

impl OccupantArena {
    /// Insert an occupant. Both JIDs must be unoccupied.
    pub fn insert(&mut self, occupant: Occupant) -> usize {
        debug_assert!(!self.by_real.contains_key(&occupant.real_jid));
        debug_assert!(!self.by_nick.contains_key(&occupant.room_jid));
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(occupant.clone());
                id
            }
            None => {
                self.slots.push(Some(occupant.clone()));
                self.slots.len() - 1
            }
        };
        self.by_real.insert(occupant.real_jid, id);
        self.by_nick.insert(occupant.room_jid, id);
        id
    }

    /// Remove by id, invalidating only that id.
    pub fn remove(&mut self, id: usize) -> Option<Occupant> {
        let occupant = self.slots.get_mut(id)?.take()?;
        self.by_real.remove(&occupant.real_jid);
        self.by_nick.remove(&occupant.room_jid);
        self.free.push(id);
        Some(occupant)
    }

    /// Occupant by arena id.
    pub fn get(&self, id: usize) -> Option<&Occupant> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    /// Mutable occupant by arena id.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Occupant> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Arena id for a real full JID.
    pub fn id_by_real(&self, real_jid: &str) -> Option<usize> {
        self.by_real.get(real_jid).copied()
    }

    /// Arena id for a room-nickname JID.
    pub fn id_by_nick(&self, room_jid: &str) -> Option<usize> {
        self.by_nick.get(room_jid).copied()
    }

    /// Iterate (id, occupant) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Occupant)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|o| (id, o)))
    }

    /// Number of occupants.
    pub fn len(&self) -> usize {
        self.by_real.len()
    }

    /// Whether the room is empty.
    pub fn is_empty(&self) -> bool {
        self.by_real.is_empty()
    }
}

/// In-memory room state.
#[derive(Debug)]
pub struct Room {
    /// Room bare JID.
    pub jid: String,
    /// Human-readable name.
    pub name: String,
    /// Only members may join.
    pub members_only: bool,
    /// Survives emptying and restarts.
    pub persistent: bool,
    /// Listed to everyone in discovery.
    pub public: bool,
    /// bare JID → affiliation.
    pub affiliations: HashMap<String, Affiliation>,
    /// Current occupants.
    pub occupants: OccupantArena,
    /// Bounded groupchat history.
    pub history: VecDeque<Stanza>,
}

impl Room {
    /// Create a fresh, non-persistent private room.
    pub fn new(jid: &str, name: &str) -> Self {
        Self {
            jid: jid.to_string(),
            name: name.to_string(),
            members_only: false,
            persistent: false,
            public: false,
            affiliations: HashMap::new(),
            occupants: OccupantArena::default(),
            history: VecDeque::new(),
        }
    }

    /// Effective affiliation of a JID: server admins override as Owner.
    pub fn affiliation_of(&self, admins: &[String], jid: &str) -> Affiliation {
        let bare = jid_to_bare(jid);
        if admins.iter().any(|a| a == bare) {
            Affiliation::Owner
        } else {
            self.affiliations
                .get(bare)
                .copied()
                .unwrap_or(Affiliation::None)
        }
    }

    /// Storage row for this room.
    pub fn to_record(&self) -> RoomRecord {
        RoomRecord {
            jid: self.jid.clone(),
            name: self.name.clone(),
            members_only: self.members_only,
            persistent: self.persistent,
            public: self.public,
        }
    }
}

/// Build a `muc#user` extension element for occupant presence.
pub fn build_muc_user(
    affiliation: Affiliation,
    role: Role,
    real_jid: Option<&str>,
    reason: Option<&str>,
    codes: &[u16],
) -> Element {
    let mut item = Element::builder("item", ns::MUC_USER)
        .attr("affiliation", affiliation.as_str())
        .attr("role", role.as_str());
    if let Some(real_jid) = real_jid {
        item = item.attr("jid", real_jid);
    }
    if let Some(reason) = reason {
        item = item.append(
            Element::builder("reason", ns::MUC_USER)
                .append(reason)
                .build(),
        );
    }
    let mut x = Element::builder("x", ns::MUC_USER).append(item.build());
    for code in codes {
        x = x.append(
            Element::builder("status", ns::MUC_USER)
                .attr("code", code.to_string())
                .build(),
        );
    }
    x.build()
}

/// Truncate a body at a UTF-8 boundary at or below `limit` bytes.
pub fn truncate_body(body: &str, limit: usize) -> &str {
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// The MUC extension.
pub struct MucExtension {
    pub(crate) config: MucConfig,
    pub(crate) service_jid: OnceLock<String>,
    pub(crate) rooms: Mutex<HashMap<String, Room>>,
}

impl MucExtension {
    /// Create the extension.
    pub fn new(config: MucConfig) -> Self {
        Self {
            config,
            service_jid: OnceLock::new(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn service_jid(&self) -> &str {
        self.service_jid.get().map(String::as_str).unwrap_or("")
    }

    /// Presence relayed between occupants: the incoming stanza with the
    /// sender's room address, recipient addressing, and a `muc#user`
    /// payload attached.
    pub(crate) fn occupant_presence(
        &self,
        base: &Stanza,
        room: &Room,
        sender: &Occupant,
        recipient: &Occupant,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> Stanza {
        let mut presence = base.clone();
        presence.set_from(&sender.room_jid);
        presence.set_to(&recipient.real_jid);
        presence.remove_children("x", ns::MUC_USER);
        presence.remove_children("x", ns::MUC);

        let mut codes = Vec::new();
        if let Some(code) = code {
            codes.push(code);
        }
        if recipient.real_jid == sender.real_jid {
            codes.push(110);
        }
        // real JIDs are disclosed to moderators only
        let real_jid = (recipient.role == Role::Moderator).then_some(sender.real_jid.as_str());
        presence.append(build_muc_user(
            room.affiliation_of(&self.config.admins, &sender.real_jid),
            sender.role,
            real_jid,
            reason,
            &codes,
        ));
        presence
    }

    async fn handle_component_stanza(
        &self,
        server: &Server,
        stanza: &Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() == StanzaKind::Iq && stanza.type_attr() == "get" {
            if let Some(kind) = crate::disco::disco_query_kind(stanza) {
                let mut response = stanza.result_for();
                if kind == "info" {
                    let features = vec![
                        ns::DISCO_INFO.to_string(),
                        ns::DISCO_ITEMS.to_string(),
                        ns::MUC.to_string(),
                    ];
                    response.append(crate::disco::build_info(
                        "conference",
                        "text",
                        "Chatrooms",
                        &features,
                    ));
                } else {
                    let rooms = self.rooms.lock().await;
                    let mut items = Vec::new();
                    for room in rooms.values() {
                        // private rooms are listed to occupants and to
                        // holders of at least Member affiliation
                        if !room.public
                            && room.occupants.id_by_real(stanza.from()).is_none()
                        {
                            let affiliation =
                                room.affiliation_of(&self.config.admins, stanza.from());
                            if affiliation <= Affiliation::None {
                                continue;
                            }
                        }
                        let mut details = room.occupants.len().to_string();
                        if !room.public {
                            details = format!("private, {details}");
                        }
                        items.push((
                            room.jid.clone(),
                            Some(format!("{} ({})", room.name, details)),
                        ));
                    }
                    items.sort();
                    response.append(crate::disco::build_items(&items));
                }
                server.send_packet(response).await;
                return Ok(Handled::Consumed);
            }
        }
        // nothing else is addressed to the bare component
        Ok(Handled::Consumed)
    }

    async fn handle_room_disco(
        &self,
        server: &Server,
        stanza: &Stanza,
        room: &Room,
        kind: &str,
    ) {
        let mut response = stanza.result_for();
        if kind == "info" {
            let mut features = vec![
                ns::DISCO_INFO.to_string(),
                ns::DISCO_ITEMS.to_string(),
                ns::MUC.to_string(),
            ];
            if !room.public {
                features.push("muc_hidden".to_string());
            }
            if !room.persistent {
                features.push("muc_temporary".to_string());
            }
            features.push("muc_semianonymous".to_string());
            response.append(crate::disco::build_info(
                "conference",
                "text",
                &room.name,
                &features,
            ));
        } else {
            let mut items: Vec<(String, Option<String>)> = room
                .occupants
                .iter()
                .map(|(_, occupant)| (occupant.room_jid.clone(), None))
                .collect();
            items.sort();
            response.append(crate::disco::build_items(&items));
        }
        server.send_packet(response).await;
    }

    async fn handle_groupchat_message(
        &self,
        server: &Server,
        stanza: &Stanza,
        room: &mut Room,
    ) -> Result<(), XmppError> {
        if stanza.type_attr() != "groupchat" {
            return Ok(());
        }

        let has_subject = stanza.child_named("subject").is_some();
        let sender = match room
            .occupants
            .id_by_real(stanza.from())
            .and_then(|id| room.occupants.get(id))
            .cloned()
        {
            Some(occupant)
                if occupant.role >= Role::Participant
                    && (occupant.role == Role::Moderator || !has_subject) =>
            {
                occupant
            }
            _ => {
                let mut error = stanza
                    .error_reply(StanzaErrorType::Auth, StanzaErrorCondition::Forbidden);
                error.set_from(stanza.to());
                error.set_to(stanza.from());
                server.send_packet(error).await;
                return Ok(());
            }
        };

        let mut message = stanza.clone();
        if let Some(body) = message.body() {
            if body.len() > LONG_MESSAGE_BYTES {
                tracing::warn!(
                    from = stanza.from(),
                    room = %room.jid,
                    bytes = body.len(),
                    "long groupchat message"
                );
            }
            if body.len() > TRUNCATE_BYTES {
                let mut truncated = truncate_body(&body, TRUNCATE_BYTES).to_string();
                truncated.push_str(TRUNCATE_MARKER);
                message.set_body(&truncated);
            }
        }
        message.set_from(&sender.room_jid);
        message.stamp_delay(&room.jid, chrono::Utc::now());

        room.history.push_back(message.clone());
        while room.history.len() > HISTORY_LIMIT {
            room.history.pop_front();
        }
        server.metrics().update_counter("muc.message.send");

        for (_, occupant) in room.occupants.iter() {
            let mut copy = message.clone();
            copy.set_to(&occupant.real_jid);
            server.send_packet(copy).await;
        }
        Ok(())
    }

    async fn handle_occupant_presence(
        &self,
        server: &Server,
        stanza: &Stanza,
    ) -> Result<Handled, XmppError> {
        let from = stanza.from().to_string();
        let to = stanza.to().to_string();
        let presence_type = stanza.type_attr().to_string();
        let room_name = jid_to_user(&to).to_string();

        let mut rooms = self.rooms.lock().await;

        let mut created = false;
        if !rooms.contains_key(&room_name) && presence_type.is_empty() {
            debug!(room = %room_name, "creating room");
            let room_jid = format!("{}@{}", room_name, self.service_jid());
            let mut room = Room::new(&room_jid, &room_name);
            room.affiliations
                .insert(jid_to_bare(&from).to_string(), Affiliation::Owner);
            rooms.insert(room_name.clone(), room);
            server
                .metrics()
                .set_gauge("muc.room.count", rooms.len() as i64);
            created = true;
        }

        let Some(room) = rooms.get_mut(&room_name) else {
            return Ok(Handled::Consumed);
        };

        if room.occupants.id_by_real(&from).is_none() {
            if !presence_type.is_empty() {
                // not in the room and not joining it
                return Ok(Handled::Consumed);
            }

            let affiliation = room.affiliation_of(&self.config.admins, &from);
            let rejection = if affiliation == Affiliation::Outcast {
                Some((StanzaErrorType::Cancel, StanzaErrorCondition::Forbidden))
            } else if room.members_only && affiliation < Affiliation::Member {
                Some((
                    StanzaErrorType::Auth,
                    StanzaErrorCondition::RegistrationRequired,
                ))
            } else if room.occupants.id_by_nick(&to).is_some() {
                Some((StanzaErrorType::Cancel, StanzaErrorCondition::Conflict))
            } else {
                None
            };
            if let Some((error_type, condition)) = rejection {
                let mut error = stanza.error_reply(error_type, condition);
                error.set_from(&to);
                error.set_to(&from);
                server.send_packet(error).await;
                return Ok(Handled::Consumed);
            }

            let role = if affiliation >= Affiliation::Admin {
                Role::Moderator
            } else {
                Role::Participant
            };
            let newcomer = Occupant {
                real_jid: from.clone(),
                room_jid: to.clone(),
                role,
            };
            info!(
                nick = jid_to_resource(&to),
                jid = %from,
                room = %room.jid,
                "occupant joining"
            );

            // the newcomer first learns about everyone already present
            for (_, existing) in room.occupants.iter() {
                let presence = self.occupant_presence(
                    &Stanza::presence(),
                    room,
                    existing,
                    &newcomer,
                    None,
                    None,
                );
                server.send_packet(presence).await;
            }
            // then gets the room history
            for entry in &room.history {
                let mut copy = entry.clone();
                copy.set_to(&from);
                server.send_packet(copy).await;
            }

            room.occupants.insert(newcomer);
            server.metrics().set_gauge(
                "muc.participant.count",
                rooms
                    .values()
                    .map(|r| r.occupants.len() as i64)
                    .sum::<i64>(),
            );
        } else if let Some(occupant) = room
            .occupants
            .id_by_real(&from)
            .and_then(|id| room.occupants.get(id))
        {
            if occupant.room_jid != to {
                // joined under another nickname; deny the change
                let mut error = stanza.error_reply(
                    StanzaErrorType::Cancel,
                    StanzaErrorCondition::NotAcceptable,
                );
                error.set_from(&to);
                error.set_to(&from);
                server.send_packet(error).await;
                return Ok(Handled::Consumed);
            }
        }

        // relay the join/leave presence to every occupant
        let Some(room) = rooms.get_mut(&room_name) else {
            return Ok(Handled::Consumed);
        };
        let Some(sender_id) = room.occupants.id_by_real(&from) else {
            return Err(XmppError::internal(format!(
                "occupant vanished mid-join: {from}"
            )));
        };
        let Some(sender) = room.occupants.get(sender_id).cloned() else {
            return Err(XmppError::internal(format!("dead arena id for {from}")));
        };
        let recipients: Vec<Occupant> = room
            .occupants
            .iter()
            .map(|(_, occupant)| occupant.clone())
            .collect();
        for recipient in &recipients {
            let code = (created && recipient.real_jid == sender.real_jid).then_some(201);
            let presence =
                self.occupant_presence(stanza, room, &sender, recipient, code, None);
            server.send_packet(presence).await;
        }

        if presence_type == "unavailable" {
            info!(
                nick = jid_to_resource(&to),
                jid = %from,
                room = %room.jid,
                "occupant leaving"
            );
            room.occupants.remove(sender_id);
            let destroy = room.occupants.is_empty() && !room.persistent;
            if destroy {
                debug!(room = %room.jid, "destroying empty room");
                rooms.remove(&room_name);
            }
            server
                .metrics()
                .set_gauge("muc.room.count", rooms.len() as i64);
            server.metrics().set_gauge(
                "muc.participant.count",
                rooms
                    .values()
                    .map(|r| r.occupants.len() as i64)
                    .sum::<i64>(),
            );
        }

        // pass through so directed-presence bookkeeping sees it
        Ok(Handled::Pass)
    }
}

#[async_trait]
impl Extension for MucExtension {
    fn name(&self) -> &'static str {
        "muc"
    }

    async fn start(&self, server: &std::sync::Arc<Server>) -> Result<(), XmppError> {
        let service_jid = self
            .config
            .jid
            .clone()
            .unwrap_or_else(|| format!("conference.{}", server.domain()));
        let _ = self.service_jid.set(service_jid);

        // restore persistent rooms
        let mut rooms = self.rooms.lock().await;
        for record in server.storage().muc_rooms().await? {
            let mut room = Room::new(&record.jid, &record.name);
            room.members_only = record.members_only;
            room.persistent = true;
            room.public = record.public;
            for affiliation in server.storage().muc_affiliations(&record.jid).await? {
                room.affiliations
                    .insert(affiliation.jid, affiliation.affiliation);
            }
            rooms.insert(jid_to_user(&record.jid).to_string(), room);
        }
        server
            .metrics()
            .set_gauge("muc.room.count", rooms.len() as i64);
        server.metrics().set_gauge("muc.participant.count", 0);
        Ok(())
    }

    fn discovery_items(&self) -> Vec<String> {
        vec![self.service_jid().to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        let to = stanza.to().to_string();
        if jid_to_domain(&to) != self.service_jid() {
            return Ok(Handled::Pass);
        }

        if to == self.service_jid() {
            return self.handle_component_stanza(server, stanza).await;
        }

        if jid_to_resource(&to).is_empty() {
            // addressed to the room itself
            let room_name = jid_to_user(&to).to_string();
            let mut rooms = self.rooms.lock().await;
            let Some(room) = rooms.get_mut(&room_name) else {
                return Ok(Handled::Consumed);
            };

            match stanza.kind() {
                StanzaKind::Iq => {
                    if stanza.type_attr() == "get" {
                        if let Some(kind) = crate::disco::disco_query_kind(stanza) {
                            self.handle_room_disco(server, stanza, room, kind).await;
                            return Ok(Handled::Consumed);
                        }
                    }
                    if stanza.child("query", ns::MUC_ADMIN).is_some() {
                        self.handle_admin_iq(server, stanza, room).await?;
                        return Ok(Handled::Consumed);
                    }
                    if stanza.child("query", ns::MUC_OWNER).is_some() {
                        self.handle_owner_iq(server, stanza, room).await?;
                        return Ok(Handled::Consumed);
                    }
                }
                StanzaKind::Message => {
                    self.handle_groupchat_message(server, stanza, room).await?;
                    return Ok(Handled::Consumed);
                }
                StanzaKind::Presence => {}
            }
            return Ok(Handled::Consumed);
        }

        // addressed to an occupant
        if stanza.kind() == StanzaKind::Presence {
            return self.handle_occupant_presence(server, stanza).await;
        }

        // private message or IQ between occupants: rewrite both ends
        let rooms = self.rooms.lock().await;
        let room_name = jid_to_user(&to).to_string();
        if let Some(room) = rooms.get(&room_name) {
            let sender = room
                .occupants
                .id_by_real(stanza.from())
                .and_then(|id| room.occupants.get(id));
            let recipient = room
                .occupants
                .id_by_nick(&to)
                .and_then(|id| room.occupants.get(id));
            if let (Some(sender), Some(recipient)) = (sender, recipient) {
                let mut relayed = stanza.clone();
                relayed.set_from(&sender.room_jid);
                relayed.set_to(&recipient.real_jid);
                server.inject(relayed);
            }
        }
        Ok(Handled::Consumed)
    }
}

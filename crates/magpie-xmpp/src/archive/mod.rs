//! Message archive (XEP-0136) and the offline queue.
//!
//! Every local chat message lands in a per-pair chat collection; a new
//! collection opens when the previous one has been quiet for an hour.
//! Messages to local users with no live resource are serialized into the
//! offline queue and replayed on the first available presence.

pub mod rsm;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::storage::Storage;
use crate::util::{jid_to_bare, jid_to_domain, jid_to_resource};

use self::rsm::{build_rsm_reply, paginate, parse_rsm};

/// Seconds of silence after which a new collection starts.
pub const COLLECTION_ROLLOVER_SECS: i64 = 3600;

/// A chat collection row: one conversation window between two bare JIDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCollectionRecord {
    /// Row id, used as the RSM anchor.
    pub id: i64,
    /// Local bare JID owning the collection.
    pub owner: String,
    /// Remote bare JID.
    pub with: String,
    /// Collection start time.
    pub start: DateTime<Utc>,
}

/// An archived message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    /// Row id, used as the RSM anchor.
    pub id: i64,
    /// Owning collection.
    pub chat_id: i64,
    /// Message body.
    pub body: String,
    /// Server receive time.
    pub date: DateTime<Utc>,
    /// True when the local user was the recipient.
    pub received: bool,
}

/// A queued offline message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineMessageRecord {
    /// Row id.
    pub id: i64,
    /// Recipient bare JID.
    pub jid: String,
    /// Serialized stanza.
    pub data: String,
    /// Server receive time.
    pub stamp: DateTime<Utc>,
}

/// The archive extension.
pub struct ArchiveExtension;

impl ArchiveExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }

    /// Store a message into the right collection of `local`'s archive,
    /// opening a new collection after an hour of silence.
    pub async fn save_message(
        &self,
        server: &Server,
        local: &str,
        remote: &str,
        body: &str,
        now: DateTime<Utc>,
        received: bool,
    ) -> Result<(), XmppError> {
        let storage = server.storage();
        let chat_id = match storage.latest_chat_message(local, remote).await? {
            Some((chat_id, last_date))
                if (now - last_date).num_seconds() < COLLECTION_ROLLOVER_SECS =>
            {
                chat_id
            }
            _ => storage.create_chat_collection(local, remote, now).await?,
        };
        storage.append_chat_message(chat_id, body, now, received).await?;
        Ok(())
    }

    async fn handle_message(
        &self,
        server: &Server,
        stanza: &Stanza,
    ) -> Result<Handled, XmppError> {
        let domain = server.domain();
        let from = stanza.from();
        let to = stanza.to();
        // whole seconds, so collection starts survive the wire round-trip
        let now = Utc::now();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let body = stanza.body().unwrap_or_default();

        if jid_to_domain(from) == domain {
            self.save_message(server, jid_to_bare(from), jid_to_bare(to), &body, now, false)
                .await?;
        }

        if jid_to_domain(to) == domain {
            self.save_message(server, jid_to_bare(to), jid_to_bare(from), &body, now, true)
                .await?;

            // queue for offline delivery when no matching resource is live
            let found = server
                .presence()
                .available_presences(jid_to_bare(to))
                .iter()
                .any(|presence| {
                    jid_to_resource(to).is_empty() || presence.from() == to
                });
            if !found {
                let mut copy = stanza.clone();
                copy.set_to(jid_to_bare(to));
                copy.remove_children("active", ns::CHAT_STATES);
                copy.remove_children("composing", ns::CHAT_STATES);
                copy.remove_children("paused", ns::CHAT_STATES);
                copy.remove_children("inactive", ns::CHAT_STATES);
                copy.remove_children("gone", ns::CHAT_STATES);
                copy.stamp_delay(domain, now);
                server
                    .storage()
                    .push_offline_message(jid_to_bare(to), &copy.serialize(), now)
                    .await?;
                debug!(to = jid_to_bare(to), "queued offline message");
                return Ok(Handled::Consumed);
            }
        }

        Ok(Handled::Pass)
    }

    /// Replay the offline queue on a user's initial available presence.
    async fn drain_offline(&self, server: &Server, full_jid: &str) -> Result<(), XmppError> {
        let bare = jid_to_bare(full_jid);
        for row in server.storage().offline_messages(bare).await? {
            match Stanza::parse(&row.data) {
                Ok(stanza) => {
                    if server.send_packet(stanza).await {
                        server.storage().remove_offline_message(row.id).await?;
                    }
                }
                Err(e) => {
                    warn!(error = %e, jid = bare, "dropping unparsable offline row");
                    server.storage().remove_offline_message(row.id).await?;
                }
            }
        }
        Ok(())
    }

    fn chat_element(&self, chat: &ChatCollectionRecord) -> Element {
        Element::builder("chat", ns::ARCHIVE)
            .attr("with", chat.with.as_str())
            .attr("start", chat.start.to_rfc3339_opts(SecondsFormat::Secs, true))
            .build()
    }

    fn parse_range(
        &self,
        elem: &Element,
    ) -> (Option<String>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let with = elem
            .attr("with")
            .map(|w| jid_to_bare(w).to_string())
            .filter(|w| !w.is_empty());
        let parse = |attr: &str| {
            elem.attr(attr)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };
        (with, parse("start"), parse("end"))
    }

    async fn handle_list(
        &self,
        server: &Server,
        stanza: &Stanza,
        list: &Element,
    ) -> Result<(), XmppError> {
        let owner = jid_to_bare(stanza.from());
        // the date range is applied to the collection start on both ends,
        // matching deployed client expectations rather than the XEP's
        // end-time upper bound
        let (with, from, to) = self.parse_range(list);
        let chats = server
            .storage()
            .chat_collections(owner, with.as_deref(), from, to)
            .await?;
        let rows: Vec<(String, ChatCollectionRecord)> = chats
            .into_iter()
            .map(|chat| (chat.id.to_string(), chat))
            .collect();
        let (page, reply) = paginate(&rows, &parse_rsm(list));

        let mut listing = Element::builder("list", ns::ARCHIVE);
        for chat in &page {
            listing = listing.append(self.chat_element(chat));
        }
        listing = listing.append(build_rsm_reply(&reply));

        let mut response = stanza.result_for();
        response.append(listing.build());
        server.send_packet(response).await;
        Ok(())
    }

    async fn handle_retrieve(
        &self,
        server: &Server,
        stanza: &Stanza,
        retrieve: &Element,
    ) -> Result<(), XmppError> {
        let owner = jid_to_bare(stanza.from());
        let (with, start, _) = self.parse_range(retrieve);
        let Some(start) = start else {
            let reply = stanza
                .error_reply(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest);
            server.send_packet(reply).await;
            return Ok(());
        };
        let Some(chat) = server
            .storage()
            .chat_collection_by_start(owner, with.as_deref(), start)
            .await?
        else {
            let reply = stanza
                .error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::ItemNotFound);
            server.send_packet(reply).await;
            return Ok(());
        };

        let messages = server.storage().chat_messages(chat.id).await?;
        let rows: Vec<(String, ChatMessageRecord)> = messages
            .into_iter()
            .map(|message| (message.id.to_string(), message))
            .collect();
        let (page, reply) = paginate(&rows, &parse_rsm(retrieve));

        let mut chat_elem = Element::builder("chat", ns::ARCHIVE)
            .attr("with", chat.with.as_str())
            .attr("start", chat.start.to_rfc3339_opts(SecondsFormat::Secs, true));
        for message in &page {
            let name = if message.received { "from" } else { "to" };
            chat_elem = chat_elem.append(
                Element::builder(name, ns::ARCHIVE)
                    .attr("utc", message.date.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .append(
                        Element::builder("body", ns::ARCHIVE)
                            .append(message.body.as_str())
                            .build(),
                    )
                    .build(),
            );
        }
        chat_elem = chat_elem.append(build_rsm_reply(&reply));

        let mut response = stanza.result_for();
        response.append(chat_elem.build());
        server.send_packet(response).await;
        Ok(())
    }

    async fn handle_remove(
        &self,
        server: &Server,
        stanza: &Stanza,
        remove: &Element,
    ) -> Result<(), XmppError> {
        let owner = jid_to_bare(stanza.from());
        let (with, from, to) = self.parse_range(remove);
        let chats = server
            .storage()
            .chat_collections(owner, with.as_deref(), from, to)
            .await?;
        if chats.is_empty() {
            let reply = stanza
                .error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::ItemNotFound);
            server.send_packet(reply).await;
            return Ok(());
        }
        let ids: Vec<i64> = chats.iter().map(|chat| chat.id).collect();
        server.storage().remove_chat_collections(&ids).await?;
        server.send_packet(stanza.result_for()).await;
        Ok(())
    }
}

impl Default for ArchiveExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for ArchiveExtension {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::ARCHIVE.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        let domain = server.domain();
        let from = stanza.from().to_string();
        let to = stanza.to().to_string();

        match stanza.kind() {
            StanzaKind::Message => {
                let local_endpoint =
                    jid_to_domain(&from) == domain || jid_to_domain(&to) == domain;
                if to != domain
                    && local_endpoint
                    && !matches!(stanza.type_attr(), "error" | "groupchat" | "headline")
                    && stanza.body().map_or(false, |body| !body.is_empty())
                {
                    return self.handle_message(server, stanza).await;
                }
            }
            StanzaKind::Presence => {
                let presence_type = stanza.type_attr();
                if (presence_type.is_empty() || presence_type == "available")
                    && jid_to_domain(&from) == domain
                    && to == domain
                    // the presence engine runs after us, so on the initial
                    // presence no entry exists yet for this resource
                    && !server.presence().has_available(&from)
                {
                    self.drain_offline(server, &from).await?;
                }
            }
            StanzaKind::Iq => {
                if to != domain {
                    return Ok(Handled::Pass);
                }
                if stanza.type_attr() == "get" {
                    if let Some(list) = stanza.child("list", ns::ARCHIVE).cloned() {
                        self.handle_list(server, stanza, &list).await?;
                        return Ok(Handled::Consumed);
                    }
                    if let Some(retrieve) = stanza.child("retrieve", ns::ARCHIVE).cloned() {
                        self.handle_retrieve(server, stanza, &retrieve).await?;
                        return Ok(Handled::Consumed);
                    }
                }
                if stanza.type_attr() == "set" {
                    if let Some(remove) = stanza.child("remove", ns::ARCHIVE).cloned() {
                        self.handle_remove(server, stanza, &remove).await?;
                        return Ok(Handled::Consumed);
                    }
                }
            }
        }
        Ok(Handled::Pass)
    }
}

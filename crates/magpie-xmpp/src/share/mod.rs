//! File-share coordination service.
//!
//! Lives at `shares.<domain>` with identity `store/file`. Share clients
//! register with an `available` presence carrying a shares payload; the
//! service keeps a peer registry, periodically explores peers for their
//! share totals, broadcasts the sorted peer catalog after every change,
//! and fans searches out to all peers, aggregating replies under a
//! deadline. Files themselves never pass through the server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use minidom::Element;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::util::{jid_to_domain, jid_to_resource, jid_to_user};

/// How long a federated search waits for peer replies.
pub const SEARCH_MAX_SECONDS: u64 = 10;

/// Delay before a newly registered peer is first explored.
pub const FIRST_EXPLORE_SECS: i64 = 59;

/// Interval between exploration scans.
pub const EXPLORE_TICK_SECS: u64 = 60;

/// Re-exploration period per peer.
pub const EXPLORE_PERIOD_SECS: i64 = 3 * 3600;

/// Share service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShareConfig {
    /// Service JID; defaults to `shares.<domain>`.
    #[serde(default)]
    pub jid: Option<String>,
    /// Domains whose clients may register; defaults to the server domain.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Tell clients to always use the proxy for transfers.
    #[serde(default)]
    pub force_proxy: bool,
    /// When set, clients are redirected to this domain instead of
    /// registering.
    #[serde(default)]
    pub redirect_domain: Option<String>,
    /// Server host sent along with a redirect.
    #[serde(default)]
    pub redirect_server: Option<String>,
    /// Federated search deadline, seconds.
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

fn default_search_timeout() -> u64 {
    SEARCH_MAX_SECONDS
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            jid: None,
            allowed_domains: Vec::new(),
            force_proxy: false,
            redirect_domain: None,
            redirect_server: None,
            search_timeout_secs: default_search_timeout(),
        }
    }
}

/// A node in a share listing: either a collection or a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareItem {
    /// True for files, false for collections.
    pub is_file: bool,
    /// Display name.
    pub name: String,
    /// File size, or aggregate size for collections.
    pub size: i64,
    /// Location JID.
    pub location: String,
    /// Child items (collections only).
    pub children: Vec<ShareItem>,
}

impl ShareItem {
    /// An empty collection at a location.
    pub fn collection(location: &str) -> Self {
        Self {
            is_file: false,
            name: String::new(),
            size: 0,
            location: location.to_string(),
            children: Vec::new(),
        }
    }

    /// Sum of file sizes and file count in this subtree.
    pub fn totals(&self) -> (i64, i64) {
        let mut bytes = 0;
        let mut files = 0;
        for child in &self.children {
            if child.is_file {
                bytes += child.size;
                files += 1;
            } else {
                let (b, f) = child.totals();
                bytes += b;
                files += f;
            }
        }
        (bytes, files)
    }

    /// Serialize to a wire element.
    pub fn to_element(&self) -> Element {
        let name = if self.is_file { "file" } else { "collection" };
        let mut builder = Element::builder(name, ns::SHARES)
            .attr("name", self.name.as_str())
            .attr("size", self.size.to_string())
            .attr("jid", self.location.as_str());
        for child in &self.children {
            builder = builder.append(child.to_element());
        }
        builder.build()
    }

    /// Parse from a wire element.
    pub fn from_element(elem: &Element) -> Option<Self> {
        let is_file = match elem.name() {
            "file" => true,
            "collection" => false,
            _ => return None,
        };
        Some(Self {
            is_file,
            name: elem.attr("name").unwrap_or("").to_string(),
            size: elem.attr("size").and_then(|s| s.parse().ok()).unwrap_or(0),
            location: elem.attr("jid").unwrap_or("").to_string(),
            children: elem.children().filter_map(Self::from_element).collect(),
        })
    }
}

/// A registered share peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Full JID of the share client.
    pub jid: String,
    /// Display nickname.
    pub nickname: String,
    /// Last explored share size.
    pub bytes: i64,
    /// Last explored file count.
    pub files: i64,
    /// Whether a first exploration completed.
    pub explored: bool,
    /// When to explore next.
    pub explore_next: DateTime<Utc>,
    /// Tag of the exploration in flight; stale replies are dropped.
    pub explore_tag: Option<String>,
}

/// Sort key: share size descending, nickname ascending case-insensitively.
fn peer_sorts_before(a: &Peer, b: &Peer) -> bool {
    if a.bytes != b.bytes {
        return a.bytes > b.bytes;
    }
    a.nickname.to_lowercase() < b.nickname.to_lowercase()
}

/// A federated search in flight.
struct Search {
    /// Requester full JID.
    requester: String,
    /// Original IQ id.
    request_id: String,
    /// Original client-supplied tag.
    request_tag: String,
    /// Aggregated result collection.
    collection: ShareItem,
    /// Outstanding per-peer request ids.
    pending: HashSet<String>,
}

#[derive(Default)]
struct ShareState {
    peers: HashMap<String, Peer>,
    searches: HashMap<String, Search>,
    available_bytes: i64,
    available_files: i64,
}

struct ShareInner {
    config: ShareConfig,
    service_jid: OnceLock<String>,
    allowed_domains: OnceLock<Vec<String>>,
    server: OnceLock<std::sync::Weak<Server>>,
    state: Mutex<ShareState>,
}

impl ShareInner {
    fn service_jid(&self) -> &str {
        self.service_jid.get().map(String::as_str).unwrap_or("")
    }

    fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains
            .get()
            .map(|domains| domains.iter().any(|d| d == domain))
            .unwrap_or(false)
    }

    /// The catalog: every peer as a collection, sorted by share size.
    fn catalog(&self, state: &ShareState) -> ShareItem {
        let mut root = ShareItem::collection(self.service_jid());
        let mut peers: Vec<&Peer> = state.peers.values().collect();
        peers.sort_by(|a, b| {
            if peer_sorts_before(a, b) {
                std::cmp::Ordering::Less
            } else if peer_sorts_before(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        for peer in peers {
            root.children.push(ShareItem {
                is_file: false,
                name: peer.nickname.clone(),
                size: peer.bytes,
                location: peer.jid.clone(),
                children: Vec::new(),
            });
        }
        root
    }

    fn search_iq(&self, to: &str, tag: &str, search: &str, depth: i64) -> Stanza {
        let mut iq = Stanza::iq("get", &Uuid::new_v4().to_string());
        iq.set_from(self.service_jid());
        iq.set_to(to);
        iq.append(
            Element::builder("search", ns::SHARES)
                .attr("tag", tag)
                .attr("depth", depth.to_string())
                .attr("search", search)
                .build(),
        );
        iq
    }

    fn search_result(
        &self,
        to: &str,
        id: &str,
        tag: &str,
        collection: &ShareItem,
    ) -> Stanza {
        let mut iq = Stanza::iq("result", id);
        iq.set_from(self.service_jid());
        iq.set_to(to);
        iq.append(
            Element::builder("search", ns::SHARES)
                .attr("tag", tag)
                .append(collection.to_element())
                .build(),
        );
        iq
    }

    /// Send the current catalog to every registered peer.
    async fn broadcast_catalog(&self, server: &Server, state: &ShareState) {
        let catalog = self.catalog(state);
        for peer in state.peers.keys() {
            let mut iq = Stanza::iq("set", &Uuid::new_v4().to_string());
            iq.set_from(self.service_jid());
            iq.set_to(peer);
            iq.append(
                Element::builder("search", ns::SHARES)
                    .append(catalog.to_element())
                    .build(),
            );
            server.send_packet(iq).await;
        }
    }

    async fn finish_search(&self, server: &Server, search: Search) {
        debug!(to = %search.requester, tag = %search.request_tag, "search response");
        let response = self.search_result(
            &search.requester,
            &search.request_id,
            &search.request_tag,
            &search.collection,
        );
        server.send_packet(response).await;
    }
}

/// The share coordination extension.
pub struct ShareExtension {
    inner: Arc<ShareInner>,
}

impl ShareExtension {
    /// Create the extension.
    pub fn new(config: ShareConfig) -> Self {
        Self {
            inner: Arc::new(ShareInner {
                config,
                service_jid: OnceLock::new(),
                allowed_domains: OnceLock::new(),
                server: OnceLock::new(),
                state: Mutex::new(ShareState::default()),
            }),
        }
    }

    async fn handle_presence(
        &self,
        server: &Server,
        stanza: &Stanza,
    ) -> Result<Handled, XmppError> {
        let inner = &self.inner;
        let from = stanza.from().to_string();
        if from.is_empty() {
            warn!("got a share presence without a sender");
            return Ok(Handled::Consumed);
        }

        match stanza.type_attr() {
            "" | "available" => {
                let Some(shares) = stanza.child("shares", ns::SHARES) else {
                    return Ok(Handled::Consumed);
                };
                // the share protocol talks to concrete resources
                if jid_to_resource(&from).is_empty() {
                    warn!(from = %from, "refusing share registration without a resource");
                    return Ok(Handled::Consumed);
                }

                let mut reply_x = Element::builder("shares", ns::SHARES);

                if !inner.domain_allowed(jid_to_domain(&from)) {
                    warn!(from = %from, "refused share registration");
                    let mut reply = stanza.error_reply(
                        crate::error::StanzaErrorType::Auth,
                        crate::error::StanzaErrorCondition::Forbidden,
                    );
                    reply.append(reply_x.build());
                    server.send_packet(reply).await;
                    return Ok(Handled::Consumed);
                }

                if let Some(redirect_domain) = &inner.config.redirect_domain {
                    reply_x = reply_x.append(
                        Element::builder("domain", ns::SHARES)
                            .append(redirect_domain.as_str())
                            .build(),
                    );
                    if let Some(redirect_server) = &inner.config.redirect_server {
                        reply_x = reply_x.append(
                            Element::builder("server", ns::SHARES)
                                .append(redirect_server.as_str())
                                .build(),
                        );
                    }
                    let mut reply = stanza.error_reply(
                        crate::error::StanzaErrorType::Modify,
                        crate::error::StanzaErrorCondition::Redirect,
                    );
                    reply.append(reply_x.build());
                    server.send_packet(reply).await;
                    return Ok(Handled::Consumed);
                }

                let nickname = shares
                    .get_child("nickname", ns::SHARES)
                    .map(|n| n.text())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| jid_to_user(&from).to_string());

                let mut state = inner.state.lock().await;
                let mut changed = false;
                if !state.peers.contains_key(&from) {
                    state.peers.insert(
                        from.clone(),
                        Peer {
                            jid: from.clone(),
                            nickname: nickname.clone(),
                            bytes: 0,
                            files: 0,
                            explored: false,
                            // give the client time to start up before the
                            // first exploration
                            explore_next: Utc::now()
                                + chrono::Duration::seconds(FIRST_EXPLORE_SECS),
                            explore_tag: None,
                        },
                    );
                    info!(jid = %from, nickname = %nickname, "registered share peer");
                    server
                        .metrics()
                        .set_gauge("share.participant.count", state.peers.len() as i64);
                    changed = true;
                }

                if inner.config.force_proxy {
                    reply_x = reply_x.append(
                        Element::builder("force-proxy", ns::SHARES).append("1").build(),
                    );
                }
                let mut reply = Stanza::presence();
                reply.set_from(stanza.to());
                reply.set_to(&from);
                reply.append(reply_x.build());
                server.send_packet(reply).await;

                if changed {
                    inner.broadcast_catalog(server, &state).await;
                }
            }
            "unavailable" => {
                let mut state = inner.state.lock().await;
                if let Some(peer) = state.peers.remove(&from) {
                    state.available_bytes -= peer.bytes;
                    state.available_files -= peer.files;
                    info!(jid = %from, "unregistered share peer");
                    server
                        .metrics()
                        .set_gauge("share.file.size", state.available_bytes);
                    server
                        .metrics()
                        .set_gauge("share.file.count", state.available_files);
                    server
                        .metrics()
                        .set_gauge("share.participant.count", state.peers.len() as i64);
                    inner.broadcast_catalog(server, &state).await;
                }
            }
            _ => {}
        }

        // pass through so directed-presence bookkeeping fires disconnect
        // synthesis back at this service
        Ok(Handled::Pass)
    }

    async fn handle_search_iq(
        &self,
        server: &Server,
        stanza: &Stanza,
        search_elem: &Element,
    ) -> Result<Handled, XmppError> {
        let inner = &self.inner;
        let from = stanza.from().to_string();
        let tag = search_elem.attr("tag").unwrap_or("").to_string();
        let depth: i64 = search_elem
            .attr("depth")
            .and_then(|d| d.parse().ok())
            .unwrap_or(0);
        let term = search_elem.attr("search").unwrap_or("").to_string();

        let mut state = inner.state.lock().await;
        if !state.peers.contains_key(&from) {
            return Ok(Handled::Consumed);
        }

        match stanza.type_attr() {
            "get" => {
                // a plain browse is answered from the local catalog
                if term.is_empty() && depth == 1 {
                    debug!(tag = %tag, from = %from, "browse request");
                    let catalog = inner.catalog(&state);
                    let response = inner.search_result(&from, stanza.id(), &tag, &catalog);
                    server.send_packet(response).await;
                    return Ok(Handled::Consumed);
                }

                // fan the search out to every peer under a fresh tag
                debug!(tag = %tag, from = %from, "search request");
                let relay_tag = Uuid::new_v4().to_string();
                let mut search = Search {
                    requester: from.clone(),
                    request_id: stanza.id().to_string(),
                    request_tag: tag,
                    collection: ShareItem::collection(inner.service_jid()),
                    pending: HashSet::new(),
                };
                let relay_depth = if depth > 0 { (depth - 1).max(1) } else { 0 };
                let peers: Vec<String> = state.peers.keys().cloned().collect();
                for peer in peers {
                    let iq = inner.search_iq(&peer, &relay_tag, &term, relay_depth);
                    search.pending.insert(iq.id().to_string());
                    server.send_packet(iq).await;
                }
                state.searches.insert(relay_tag.clone(), search);
                drop(state);

                // the deadline is authoritative; whatever has arrived by
                // then is the answer
                let inner = Arc::clone(inner);
                let deadline = Duration::from_secs(inner.config.search_timeout_secs);
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    let Some(server) = inner.server.get().and_then(|weak| weak.upgrade())
                    else {
                        return;
                    };
                    let search = inner.state.lock().await.searches.remove(&relay_tag);
                    if let Some(search) = search {
                        warn!(tag = %relay_tag, to = %search.requester, "search timeout");
                        inner.finish_search(&server, search).await;
                    }
                });
            }
            "result" | "error" => {
                let collection = search_elem
                    .children()
                    .find(|c| c.name() == "collection")
                    .and_then(ShareItem::from_element);
                let st = &mut *state;

                // exploration replies update the peer totals
                let explore_hit = st
                    .peers
                    .get(&from)
                    .is_some_and(|peer| peer.explore_tag.as_deref() == Some(tag.as_str()));
                if explore_hit {
                    let (bytes, files) = collection
                        .as_ref()
                        .map(|c| c.totals())
                        .unwrap_or((0, 0));
                    let mut previous = (0, 0);
                    if let Some(peer) = st.peers.get_mut(&from) {
                        previous = (peer.bytes, peer.files);
                        peer.explored = true;
                        peer.bytes = bytes;
                        peer.files = files;
                        info!(from = %from, files, bytes, "explore result");
                    }
                    st.available_bytes += bytes - previous.0;
                    st.available_files += files - previous.1;
                    server
                        .metrics()
                        .set_gauge("share.file.size", st.available_bytes);
                    server
                        .metrics()
                        .set_gauge("share.file.count", st.available_files);
                    inner.broadcast_catalog(server, st).await;
                    return Ok(Handled::Consumed);
                }

                // otherwise it answers an in-flight federated search
                let Some(search) = st.searches.get_mut(&tag) else {
                    return Ok(Handled::Consumed);
                };
                if !search.pending.remove(stanza.id()) {
                    return Ok(Handled::Consumed);
                }

                if stanza.type_attr() != "error" {
                    if let Some(mut collection) = collection {
                        if !collection.children.is_empty() {
                            if let Some(peer) = st.peers.get(&from) {
                                collection.name = peer.nickname.clone();
                                collection.location = peer.jid.clone();
                                // keep sub-collections in catalog order
                                let mut row = search.collection.children.len();
                                for (i, child) in
                                    search.collection.children.iter().enumerate()
                                {
                                    if let Some(other) = st.peers.get(&child.location) {
                                        if peer_sorts_before(peer, other) {
                                            row = i;
                                            break;
                                        }
                                    }
                                }
                                search.collection.children.insert(row, collection);
                            }
                        }
                    }
                }

                if search.pending.is_empty() {
                    if let Some(search) = st.searches.remove(&tag) {
                        inner.finish_search(server, search).await;
                    }
                }
            }
            _ => {}
        }
        Ok(Handled::Consumed)
    }
}

#[async_trait]
impl Extension for ShareExtension {
    fn name(&self) -> &'static str {
        "share"
    }

    async fn start(&self, server: &Arc<Server>) -> Result<(), XmppError> {
        let inner = &self.inner;
        let service_jid = inner
            .config
            .jid
            .clone()
            .unwrap_or_else(|| format!("shares.{}", server.domain()));
        let _ = inner.service_jid.set(service_jid);
        let mut allowed = inner.config.allowed_domains.clone();
        if allowed.is_empty() {
            allowed.push(server.domain().to_string());
        }
        let _ = inner.allowed_domains.set(allowed);
        let _ = inner.server.set(Arc::downgrade(server));

        // periodic exploration keeps peer totals fresh
        let inner = Arc::clone(inner);
        let server = Arc::downgrade(server);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(EXPLORE_TICK_SECS));
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(server) = server.upgrade() else {
                    return;
                };
                let now = Utc::now();
                let mut due = Vec::new();
                {
                    let mut state = inner.state.lock().await;
                    for peer in state.peers.values_mut() {
                        if peer.explore_next > now {
                            continue;
                        }
                        let tag = Uuid::new_v4().to_string();
                        peer.explore_tag = Some(tag.clone());
                        peer.explore_next =
                            now + chrono::Duration::seconds(EXPLORE_PERIOD_SECS);
                        due.push((peer.jid.clone(), tag));
                    }
                }
                for (jid, tag) in due {
                    let iq = inner.search_iq(&jid, &tag, "", 0);
                    server.send_packet(iq).await;
                }
            }
        });
        Ok(())
    }

    fn discovery_items(&self) -> Vec<String> {
        vec![self.inner.service_jid().to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.to() != self.inner.service_jid() {
            return Ok(Handled::Pass);
        }

        match stanza.kind() {
            StanzaKind::Iq => {
                if stanza.type_attr() == "get" {
                    if let Some(kind) = crate::disco::disco_query_kind(stanza) {
                        let mut response = stanza.result_for();
                        if kind == "info" {
                            let features = vec![
                                ns::DISCO_INFO.to_string(),
                                ns::DISCO_ITEMS.to_string(),
                                ns::SHARES.to_string(),
                            ];
                            response.append(crate::disco::build_info(
                                "store",
                                "file",
                                "File sharing server",
                                &features,
                            ));
                        } else {
                            response.append(crate::disco::build_items(&[]));
                        }
                        server.send_packet(response).await;
                        return Ok(Handled::Consumed);
                    }
                }
                if let Some(search_elem) = stanza.child("search", ns::SHARES).cloned() {
                    return self.handle_search_iq(server, stanza, &search_elem).await;
                }
                Ok(Handled::Pass)
            }
            StanzaKind::Presence => self.handle_presence(server, stanza).await,
            StanzaKind::Message => Ok(Handled::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(jid: &str, nickname: &str, bytes: i64) -> Peer {
        Peer {
            jid: jid.to_string(),
            nickname: nickname.to_string(),
            bytes,
            files: 0,
            explored: true,
            explore_next: Utc::now(),
            explore_tag: None,
        }
    }

    #[test]
    fn peers_sort_by_size_then_nickname() {
        let big = peer("a@x.com/r", "zed", 100);
        let small = peer("b@x.com/r", "Alice", 10);
        let small2 = peer("c@x.com/r", "bob", 10);

        assert!(peer_sorts_before(&big, &small));
        assert!(!peer_sorts_before(&small, &big));
        // size ties order by nickname, case-insensitively
        assert!(peer_sorts_before(&small, &small2));
        assert!(!peer_sorts_before(&small2, &small));
    }

    #[test]
    fn totals_recurse() {
        let tree = ShareItem {
            is_file: false,
            name: "root".to_string(),
            size: 0,
            location: "p@x.com/r".to_string(),
            children: vec![
                ShareItem {
                    is_file: true,
                    name: "a.iso".to_string(),
                    size: 700,
                    location: "p@x.com/r".to_string(),
                    children: Vec::new(),
                },
                ShareItem {
                    is_file: false,
                    name: "sub".to_string(),
                    size: 0,
                    location: "p@x.com/r".to_string(),
                    children: vec![ShareItem {
                        is_file: true,
                        name: "b.txt".to_string(),
                        size: 42,
                        location: "p@x.com/r".to_string(),
                        children: Vec::new(),
                    }],
                },
            ],
        };
        assert_eq!(tree.totals(), (742, 2));
    }

    #[test]
    fn share_item_round_trip() {
        let item = ShareItem {
            is_file: false,
            name: "music".to_string(),
            size: 1234,
            location: "p@x.com/r".to_string(),
            children: vec![ShareItem {
                is_file: true,
                name: "song.ogg".to_string(),
                size: 1234,
                location: "p@x.com/r".to_string(),
                children: Vec::new(),
            }],
        };
        let parsed = ShareItem::from_element(&item.to_element()).unwrap();
        assert_eq!(parsed, item);
    }
}

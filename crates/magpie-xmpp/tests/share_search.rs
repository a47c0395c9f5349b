//! Share coordinator: registration, catalog fan-out, federated search.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestClient, DOMAIN};

use magpie_xmpp::auth::MemoryPasswords;
use magpie_xmpp::presence::PresenceExtension;
use magpie_xmpp::share::{ShareConfig, ShareExtension};
use magpie_xmpp::stanza::ns;
use magpie_xmpp::{MemoryStorage, Server, ServerBuilder, Stanza, StanzaKind};

const SERVICE: &str = "shares.example.com";

async fn share_server(config: ShareConfig) -> Arc<Server> {
    let server = ServerBuilder::new(
        DOMAIN,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryPasswords::new()),
    )
    .extension(Arc::new(ShareExtension::new(config)))
    .extension(Arc::new(PresenceExtension::new()))
    .build();
    server.start().await.expect("server starts");
    server
}

fn registration(nick: &str) -> String {
    format!(
        "<presence xmlns='jabber:client' to='{SERVICE}'>\
         <shares xmlns='http://magpie.im/protocol/shares'>\
         <nickname>{nick}</nickname></shares></presence>"
    )
}

/// Pull the relayed search request (tag, id) out of a peer's inbox.
fn relayed_search(stanzas: &[Stanza]) -> Option<(String, String)> {
    stanzas
        .iter()
        .find(|s| {
            s.kind() == StanzaKind::Iq
                && s.type_attr() == "get"
                && s.child("search", ns::SHARES).is_some()
        })
        .map(|s| {
            let tag = s
                .child("search", ns::SHARES)
                .and_then(|e| e.attr("tag"))
                .unwrap_or("")
                .to_string();
            (tag, s.id().to_string())
        })
}

fn search_reply(tag: &str, id: &str, file_name: &str, size: u64) -> String {
    format!(
        "<iq xmlns='jabber:client' type='result' id='{id}' to='{SERVICE}'>\
         <search xmlns='http://magpie.im/protocol/shares' tag='{tag}'>\
         <collection name='' size='{size}' jid=''>\
         <file name='{file_name}' size='{size}' jid=''/>\
         </collection></search></iq>"
    )
}

#[tokio::test]
async fn registration_reply_and_catalog() {
    let server = share_server(ShareConfig::default()).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;

    let received = p1.drain();
    // the service acknowledges with a shares presence
    assert!(received.iter().any(|s| {
        s.kind() == StanzaKind::Presence
            && s.from() == SERVICE
            && s.child("shares", ns::SHARES).is_some()
    }));
    // and broadcasts the catalog
    let catalog = received
        .iter()
        .find(|s| s.kind() == StanzaKind::Iq && s.type_attr() == "set")
        .expect("catalog broadcast");
    let collection = catalog
        .child("search", ns::SHARES)
        .and_then(|e| e.get_child("collection", ns::SHARES))
        .expect("catalog collection");
    assert_eq!(collection.children().count(), 1);
}

#[tokio::test]
async fn disallowed_domain_is_refused() {
    let config = ShareConfig {
        allowed_domains: vec!["elsewhere.example".to_string()],
        ..ShareConfig::default()
    };
    let server = share_server(config).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;

    let reply = p1.recv().await;
    assert_eq!(reply.type_attr(), "error");
    let error = reply.child_named("error").expect("error element");
    assert!(error.get_child("forbidden", ns::STANZAS).is_some());
}

#[tokio::test]
async fn redirect_is_announced() {
    let config = ShareConfig {
        redirect_domain: Some("newshares.example".to_string()),
        redirect_server: Some("host.newshares.example".to_string()),
        ..ShareConfig::default()
    };
    let server = share_server(config).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;

    let reply = p1.recv().await;
    assert_eq!(reply.type_attr(), "error");
    let error = reply.child_named("error").expect("error element");
    assert!(error.get_child("redirect", ns::STANZAS).is_some());
    let shares = reply.child("shares", ns::SHARES).expect("shares payload");
    assert_eq!(
        shares.get_child("domain", ns::SHARES).map(|d| d.text()),
        Some("newshares.example".to_string())
    );
}

#[tokio::test]
async fn federated_search_aggregates_all_replies() {
    let server = share_server(ShareConfig::default()).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    let mut p2 = TestClient::connect(&server, "p2@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;
    p2.send(&server, &registration("Quill")).await;
    p1.drain();
    p2.drain();

    // p1 searches for "foo"
    p1.send(
        &server,
        &format!(
            "<iq xmlns='jabber:client' type='get' id='s1' to='{SERVICE}'>\
             <search xmlns='http://magpie.im/protocol/shares' \
             tag='t1' depth='1' search='foo'/></iq>"
        ),
    )
    .await;

    let (tag1, id1) = relayed_search(&p1.drain()).expect("p1 receives the relayed search");
    let (tag2, id2) = relayed_search(&p2.drain()).expect("p2 receives the relayed search");
    assert_eq!(tag1, tag2);

    p2.send(&server, &search_reply(&tag2, &id2, "foo-two.iso", 900))
        .await;
    p1.send(&server, &search_reply(&tag1, &id1, "foo-one.iso", 100))
        .await;

    // every peer answered, so the aggregate comes back immediately
    let response = p1.recv().await;
    assert_eq!(response.type_attr(), "result");
    assert_eq!(response.id(), "s1");
    let search = response.child("search", ns::SHARES).expect("search payload");
    assert_eq!(search.attr("tag"), Some("t1"));
    let collection = search
        .get_child("collection", ns::SHARES)
        .expect("aggregate collection");
    let names: Vec<&str> = collection
        .children()
        .filter_map(|c| c.attr("name"))
        .collect();
    // explored sizes are still zero, so the tie orders by nickname
    assert_eq!(names, vec!["Penny", "Quill"]);
}

#[tokio::test]
async fn search_deadline_drops_late_replies() {
    let config = ShareConfig {
        search_timeout_secs: 1,
        ..ShareConfig::default()
    };
    let server = share_server(config).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    let mut p2 = TestClient::connect(&server, "p2@example.com/share").await;
    let mut p3 = TestClient::connect(&server, "p3@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;
    p2.send(&server, &registration("Quill")).await;
    p3.send(&server, &registration("Rook")).await;
    p1.drain();
    p2.drain();
    p3.drain();

    p1.send(
        &server,
        &format!(
            "<iq xmlns='jabber:client' type='get' id='s2' to='{SERVICE}'>\
             <search xmlns='http://magpie.im/protocol/shares' \
             tag='t2' depth='1' search='foo'/></iq>"
        ),
    )
    .await;

    let (tag1, id1) = relayed_search(&p1.drain()).expect("p1 relayed");
    let (tag2, id2) = relayed_search(&p2.drain()).expect("p2 relayed");
    let (tag3, id3) = relayed_search(&p3.drain()).expect("p3 relayed");

    p1.send(&server, &search_reply(&tag1, &id1, "foo-a", 1)).await;
    p2.send(&server, &search_reply(&tag2, &id2, "foo-b", 2)).await;
    // p3 stays silent past the deadline

    tokio::time::sleep(Duration::from_millis(1400)).await;

    let response = p1.recv().await;
    assert_eq!(response.id(), "s2");
    let names: Vec<String> = response
        .child("search", ns::SHARES)
        .and_then(|s| s.get_child("collection", ns::SHARES))
        .map(|c| {
            c.children()
                .filter_map(|child| child.attr("name"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"Rook".to_string()));

    // the late reply lands in the void
    p3.send(&server, &search_reply(&tag3, &id3, "foo-c", 3)).await;
    tokio::task::yield_now().await;
    assert!(p1.drain().is_empty());
}

#[tokio::test]
async fn unregistration_rebroadcasts_catalog() {
    let server = share_server(ShareConfig::default()).await;
    let mut p1 = TestClient::connect(&server, "p1@example.com/share").await;
    let mut p2 = TestClient::connect(&server, "p2@example.com/share").await;
    p1.send(&server, &registration("Penny")).await;
    p2.send(&server, &registration("Quill")).await;
    p1.drain();
    p2.drain();

    p2.send(
        &server,
        &format!("<presence xmlns='jabber:client' type='unavailable' to='{SERVICE}'/>"),
    )
    .await;

    let received = p1.drain();
    let catalog = received
        .iter()
        .rev()
        .find(|s| s.kind() == StanzaKind::Iq && s.type_attr() == "set")
        .expect("rebroadcast catalog");
    let names: Vec<&str> = catalog
        .child("search", ns::SHARES)
        .and_then(|s| s.get_child("collection", ns::SHARES))
        .map(|c| c.children().filter_map(|child| child.attr("name")).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["Penny"]);
}

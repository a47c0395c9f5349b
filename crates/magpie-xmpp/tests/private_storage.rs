//! Private XML storage and vCard round-trips.

mod common;

use common::{start_server, TestClient};

use minidom::Element;
use magpie_xmpp::ns;

#[tokio::test]
async fn private_storage_round_trip() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='set' id='p1'>\
             <query xmlns='jabber:iq:private'>\
             <storage xmlns='storage:bookmarks'>\
             <conference jid='lounge@conference.example.com' autojoin='true' name='Lounge'/>\
             </storage></query></iq>",
        )
        .await;
    let stored = alice.recv().await;
    assert_eq!(stored.type_attr(), "result");
    assert_eq!(stored.id(), "p1");

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='get' id='p2'>\
             <query xmlns='jabber:iq:private'>\
             <storage xmlns='storage:bookmarks'/></query></iq>",
        )
        .await;
    let fetched = alice.recv().await;
    assert_eq!(fetched.type_attr(), "result");
    let payload = fetched
        .child("query", ns::PRIVATE)
        .and_then(|q| q.get_child("storage", "storage:bookmarks"))
        .cloned()
        .expect("stored payload");

    // element equality is attribute-order independent
    let expected: Element =
        "<storage xmlns='storage:bookmarks'>\
         <conference autojoin='true' jid='lounge@conference.example.com' name='Lounge'/>\
         </storage>"
            .parse()
            .unwrap();
    assert_eq!(payload, expected);
}

#[tokio::test]
async fn get_of_missing_namespace_echoes_request() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='get' id='p3'>\
             <query xmlns='jabber:iq:private'>\
             <prefs xmlns='magpie:prefs'/></query></iq>",
        )
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply.type_attr(), "result");
    let payload = reply
        .child("query", ns::PRIVATE)
        .and_then(|q| q.get_child("prefs", "magpie:prefs"))
        .expect("request payload echoed");
    assert_eq!(payload.children().count(), 0);
}

#[tokio::test]
async fn payloadless_query_is_bad_request() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='get' id='p4'>\
             <query xmlns='jabber:iq:private'/></iq>",
        )
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply.type_attr(), "error");
    let error = reply.child_named("error").expect("error element");
    assert!(error.get_child("bad-request", ns::STANZAS).is_some());
}

#[tokio::test]
async fn private_storage_is_per_user() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;
    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='set' id='p5'>\
             <query xmlns='jabber:iq:private'>\
             <prefs xmlns='magpie:prefs'><sound>off</sound></prefs></query></iq>",
        )
        .await;
    alice.recv().await;

    bob.send(
        &server,
        "<iq xmlns='jabber:client' type='get' id='p6'>\
         <query xmlns='jabber:iq:private'>\
         <prefs xmlns='magpie:prefs'/></query></iq>",
    )
    .await;
    let reply = bob.recv().await;
    let payload = reply
        .child("query", ns::PRIVATE)
        .and_then(|q| q.get_child("prefs", "magpie:prefs"))
        .expect("payload");
    // bob gets the empty echo, not alice's data
    assert_eq!(payload.children().count(), 0);
}

#[tokio::test]
async fn vcard_set_then_get() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;
    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;

    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='set' id='v1'>\
             <vCard xmlns='vcard-temp'><FN>Alice</FN></vCard></iq>",
        )
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply.type_attr(), "result");

    // bob reads alice's card by her bare JID
    bob.send(
        &server,
        "<iq xmlns='jabber:client' type='get' id='v2' to='alice@example.com'>\
         <vCard xmlns='vcard-temp'/></iq>",
    )
    .await;
    let card = bob.recv().await;
    assert_eq!(card.type_attr(), "result");
    let full_name = card
        .child("vCard", ns::VCARD)
        .and_then(|v| v.get_child("FN", ns::VCARD))
        .map(|fn_elem| fn_elem.text());
    assert_eq!(full_name.as_deref(), Some("Alice"));

    // an unknown user has no card
    bob.send(
        &server,
        "<iq xmlns='jabber:client' type='get' id='v3' to='ghost@example.com'>\
         <vCard xmlns='vcard-temp'/></iq>",
    )
    .await;
    let missing = bob.recv().await;
    assert_eq!(missing.type_attr(), "error");
    let error = missing.child_named("error").expect("error element");
    assert!(error.get_child("item-not-found", ns::STANZAS).is_some());
}

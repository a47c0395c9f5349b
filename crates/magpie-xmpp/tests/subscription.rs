//! Subscription round-trip and disconnect synthesis.

mod common;

use common::{go_online, start_server, TestClient};

use magpie_xmpp::roster::{RosterContact, SubscriptionBits};
use magpie_xmpp::{ns, StanzaKind, Storage};

#[tokio::test]
async fn subscription_round_trip() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;

    // alice asks to see bob's presence while bob is offline
    alice
        .send(
            &server,
            "<presence xmlns='jabber:client' type='subscribe' to='bob@example.com'/>",
        )
        .await;

    // alice's contact carries the pending ask
    let contact = server
        .storage()
        .roster_contact("alice@example.com", "bob@example.com")
        .await
        .unwrap()
        .expect("alice has a contact row");
    assert!(contact.ask.has_to());
    assert!(!contact.subscription.has_to());

    // bob's side remembers the request as a hidden contact
    let contact = server
        .storage()
        .roster_contact("bob@example.com", "alice@example.com")
        .await
        .unwrap()
        .expect("bob has a hidden contact row");
    assert!(contact.hidden);
    assert!(contact.ask.has_from());

    // alice got a roster push for the pending ask
    let pushes = alice.drain();
    assert!(pushes
        .iter()
        .any(|s| s.kind() == StanzaKind::Iq && s.child("query", ns::ROSTER).is_some()));

    // bob connects and fetches his roster
    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;
    bob.send(
        &server,
        "<iq xmlns='jabber:client' type='get' id='r1'>\
         <query xmlns='jabber:iq:roster'/></iq>",
    )
    .await;

    let result = bob.recv().await;
    assert_eq!(result.type_attr(), "result");
    let query = result.child("query", ns::ROSTER).expect("roster query");
    // the hidden contact is not listed
    assert_eq!(query.children().count(), 0);

    // but the queued subscribe presence arrives
    let queued = bob.recv().await;
    assert_eq!(queued.kind(), StanzaKind::Presence);
    assert_eq!(queued.type_attr(), "subscribe");
    assert_eq!(queued.from(), "alice@example.com");

    // bob goes online so his presence can be replayed, then approves
    go_online(&server, &bob).await;
    bob.drain();
    alice.drain();
    bob.send(
        &server,
        "<presence xmlns='jabber:client' type='subscribed' to='alice@example.com'/>",
    )
    .await;

    // alice sees the approval and then bob's available presence
    let received = alice.drain();
    let subscribed_pos = received
        .iter()
        .position(|s| s.type_attr() == "subscribed")
        .expect("alice receives subscribed");
    let available_pos = received
        .iter()
        .position(|s| {
            s.kind() == StanzaKind::Presence
                && s.type_attr().is_empty()
                && s.from() == "bob@example.com/desk"
        })
        .expect("alice receives bob's presence");
    assert!(subscribed_pos < available_pos);

    // final states: bob grants From, alice holds To
    let bob_contact = server
        .storage()
        .roster_contact("bob@example.com", "alice@example.com")
        .await
        .unwrap()
        .expect("bob's contact");
    assert_eq!(bob_contact.subscription, SubscriptionBits::FROM);
    assert!(!bob_contact.hidden);

    let alice_contact = server
        .storage()
        .roster_contact("alice@example.com", "bob@example.com")
        .await
        .unwrap()
        .expect("alice's contact");
    assert_eq!(alice_contact.subscription, SubscriptionBits::TO);
    assert!(alice_contact.ask.is_empty());
}

#[tokio::test]
async fn disconnect_synthesizes_unavailable() {
    let server = start_server().await;

    // bob subscribes to alice's presence (From on alice's side)
    let mut contact = RosterContact::new("alice@example.com", "bob@example.com");
    contact.subscription = SubscriptionBits::FROM;
    server.storage().upsert_roster_contact(&contact).await.unwrap();

    // a remote subscriber goes through the federation hook
    let mut remote = RosterContact::new("alice@example.com", "eve@other.example");
    remote.subscription = SubscriptionBits::FROM;
    server.storage().upsert_roster_contact(&remote).await.unwrap();
    let (fed_tx, mut fed_rx) = tokio::sync::mpsc::channel(16);
    server.set_federation(fed_tx);

    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;
    go_online(&server, &bob).await;
    bob.drain();

    let alice = TestClient::connect(&server, "alice@example.com/mobile").await;
    go_online(&server, &alice).await;

    // bob sees alice come online
    let seen = bob.recv().await;
    assert_eq!(seen.from(), "alice@example.com/mobile");
    assert_eq!(seen.type_attr(), "");
    assert!(server.presence().has_available("alice@example.com/mobile"));

    // the TCP connection drops without an unavailable presence
    server.close_session("alice@example.com/mobile").await;

    let synthesized = bob.recv().await;
    assert_eq!(synthesized.kind(), StanzaKind::Presence);
    assert_eq!(synthesized.type_attr(), "unavailable");
    assert_eq!(synthesized.from(), "alice@example.com/mobile");

    // the remote subscriber gets its copy via federation
    let mut remote_copies = Vec::new();
    while let Ok(stanza) = fed_rx.try_recv() {
        remote_copies.push(stanza);
    }
    assert!(remote_copies
        .iter()
        .any(|s| s.type_attr() == "unavailable" && s.to() == "eve@other.example"));

    // no presence entry survives the disconnect
    assert!(!server.presence().has_available("alice@example.com/mobile"));
    assert!(server
        .presence()
        .available_presences("alice@example.com")
        .is_empty());
}

#[tokio::test]
async fn roster_remove_retracts_subscriptions() {
    let server = start_server().await;

    let mut contact = RosterContact::new("alice@example.com", "bob@example.com");
    contact.subscription = SubscriptionBits::BOTH;
    server.storage().upsert_roster_contact(&contact).await.unwrap();
    let mut reverse = RosterContact::new("bob@example.com", "alice@example.com");
    reverse.subscription = SubscriptionBits::BOTH;
    server.storage().upsert_roster_contact(&reverse).await.unwrap();

    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;
    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='set' id='rm1'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='bob@example.com' subscription='remove'/>\
             </query></iq>",
        )
        .await;

    // the row is gone and the push precedes the result
    assert!(server
        .storage()
        .roster_contact("alice@example.com", "bob@example.com")
        .await
        .unwrap()
        .is_none());
    let received = alice.drain();
    let push_pos = received
        .iter()
        .position(|s| s.type_attr() == "set" && s.child("query", ns::ROSTER).is_some())
        .expect("roster push");
    let result_pos = received
        .iter()
        .position(|s| s.type_attr() == "result" && s.id() == "rm1")
        .expect("iq result");
    assert!(push_pos < result_pos);
}

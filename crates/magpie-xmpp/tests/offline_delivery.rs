//! Offline queue and archive collection behavior.

mod common;

use common::{go_online, start_server, TestClient};

use chrono::{Duration, Utc};
use magpie_xmpp::archive::ArchiveExtension;
use magpie_xmpp::{ns, StanzaKind, Storage};

#[tokio::test]
async fn offline_message_is_queued_and_replayed() {
    let server = start_server().await;
    let alice = TestClient::connect(&server, "alice@example.com/home").await;
    go_online(&server, &alice).await;

    // bob is not connected
    alice
        .send(
            &server,
            "<message xmlns='jabber:client' type='chat' to='bob@example.com'>\
             <body>hi</body></message>",
        )
        .await;

    let queued = server
        .storage()
        .offline_messages("bob@example.com")
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);

    // bob connects and sends his initial presence
    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;
    go_online(&server, &bob).await;

    let received = bob.drain();
    let replayed = received
        .iter()
        .find(|s| s.kind() == StanzaKind::Message)
        .expect("offline message is replayed");
    assert_eq!(replayed.body().as_deref(), Some("hi"));
    assert_eq!(replayed.from(), "alice@example.com/home");
    // the server stamped the original receive time
    assert!(replayed.child("delay", ns::DELAY).is_some());

    assert!(server
        .storage()
        .offline_messages("bob@example.com")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn delivered_message_is_not_queued() {
    let server = start_server().await;
    let alice = TestClient::connect(&server, "alice@example.com/home").await;
    let mut bob = TestClient::connect(&server, "bob@example.com/desk").await;
    go_online(&server, &alice).await;
    go_online(&server, &bob).await;
    bob.drain();

    alice
        .send(
            &server,
            "<message xmlns='jabber:client' type='chat' to='bob@example.com'>\
             <body>live</body></message>",
        )
        .await;

    let received = bob.recv().await;
    assert_eq!(received.body().as_deref(), Some("live"));
    assert!(server
        .storage()
        .offline_messages("bob@example.com")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn collection_rollover_boundary() {
    let server = start_server().await;
    let archive = ArchiveExtension::new();
    let t0 = Utc::now();

    // 3599 seconds of silence continues the collection
    archive
        .save_message(&server, "a@example.com", "b@example.com", "one", t0, false)
        .await
        .unwrap();
    archive
        .save_message(
            &server,
            "a@example.com",
            "b@example.com",
            "two",
            t0 + Duration::seconds(3599),
            false,
        )
        .await
        .unwrap();
    let chats = server
        .storage()
        .chat_collections("a@example.com", None, None, None)
        .await
        .unwrap();
    assert_eq!(chats.len(), 1);

    // 3601 seconds of silence starts a new one
    archive
        .save_message(
            &server,
            "a@example.com",
            "b@example.com",
            "three",
            t0 + Duration::seconds(3599 + 3601),
            false,
        )
        .await
        .unwrap();
    let chats = server
        .storage()
        .chat_collections("a@example.com", None, None, None)
        .await
        .unwrap();
    assert_eq!(chats.len(), 2);
}

#[tokio::test]
async fn archive_list_count_only_matches_full_list() {
    let server = start_server().await;
    let archive = ArchiveExtension::new();
    let t0 = Utc::now() - Duration::days(1);
    for i in 0..3 {
        archive
            .save_message(
                &server,
                "alice@example.com",
                &format!("peer{i}@example.com"),
                "hello",
                t0 + Duration::seconds(i * 7200),
                false,
            )
            .await
            .unwrap();
    }

    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;

    // max=0 returns the count alone
    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='get' id='l1'>\
             <list xmlns='urn:xmpp:archive'>\
             <set xmlns='http://jabber.org/protocol/rsm'><max>0</max></set>\
             </list></iq>",
        )
        .await;
    let counted = alice.recv().await;
    assert_eq!(counted.type_attr(), "result");
    let list = counted.child("list", ns::ARCHIVE).expect("list payload");
    assert_eq!(list.children().filter(|c| c.name() == "chat").count(), 0);
    let set = list.get_child("set", ns::RSM).expect("rsm reply");
    let count: usize = set
        .get_child("count", ns::RSM)
        .map(|c| c.text().parse().unwrap())
        .expect("count present");

    // an unbounded list returns exactly that many collections
    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='get' id='l2'>\
             <list xmlns='urn:xmpp:archive'/></iq>",
        )
        .await;
    let full = alice.recv().await;
    let list = full.child("list", ns::ARCHIVE).expect("list payload");
    assert_eq!(
        list.children().filter(|c| c.name() == "chat").count(),
        count
    );
    assert_eq!(count, 3);
}

#[tokio::test]
async fn archive_remove_missing_range_is_item_not_found() {
    let server = start_server().await;
    let mut alice = TestClient::connect(&server, "alice@example.com/home").await;
    alice
        .send(
            &server,
            "<iq xmlns='jabber:client' type='set' id='rm1'>\
             <remove xmlns='urn:xmpp:archive' with='ghost@example.com'/></iq>",
        )
        .await;
    let reply = alice.recv().await;
    assert_eq!(reply.type_attr(), "error");
    let error = reply.child_named("error").expect("error element");
    assert!(error
        .get_child("item-not-found", ns::STANZAS)
        .is_some());
}

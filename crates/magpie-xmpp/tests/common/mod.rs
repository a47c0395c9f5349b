//! Shared fixtures for pipeline tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use magpie_xmpp::archive::ArchiveExtension;
use magpie_xmpp::auth::MemoryPasswords;
use magpie_xmpp::disco::DiscoExtension;
use magpie_xmpp::muc::{MucConfig, MucExtension};
use magpie_xmpp::presence::PresenceExtension;
use magpie_xmpp::privacy::{PrivacyConfig, PrivacyExtension};
use magpie_xmpp::roster::RosterExtension;
use magpie_xmpp::share::{ShareConfig, ShareExtension};
use magpie_xmpp::xep::{PingExtension, PrivateStorageExtension, VcardExtension};
use magpie_xmpp::{MemoryStorage, Server, ServerBuilder, Stanza};

/// The domain served by test servers.
pub const DOMAIN: &str = "example.com";

/// Build and start a server with the stanza-level extensions.
pub async fn start_server() -> Arc<Server> {
    let storage = Arc::new(MemoryStorage::new());
    let passwords = Arc::new(MemoryPasswords::new());
    let server = ServerBuilder::new(DOMAIN, storage, passwords)
        .extension(Arc::new(ArchiveExtension::new()))
        .extension(Arc::new(DiscoExtension::new()))
        .extension(Arc::new(MucExtension::new(MucConfig::default())))
        .extension(Arc::new(PingExtension::new()))
        .extension(Arc::new(PresenceExtension::new()))
        .extension(Arc::new(PrivacyExtension::new(PrivacyConfig::default())))
        .extension(Arc::new(PrivateStorageExtension::new()))
        .extension(Arc::new(RosterExtension::new()))
        .extension(Arc::new(ShareExtension::new(ShareConfig::default())))
        .extension(Arc::new(VcardExtension::new()))
        .build();
    server.start().await.expect("server starts");
    server
}

/// A connected test client.
pub struct TestClient {
    /// The client's full JID.
    pub jid: String,
    /// Stanzas delivered to this session.
    pub rx: mpsc::Receiver<Stanza>,
}

impl TestClient {
    /// Bind a session for `jid`.
    pub async fn connect(server: &Arc<Server>, jid: &str) -> Self {
        let (tx, rx) = mpsc::channel(256);
        server.bind_session(jid, tx, None).await;
        Self {
            jid: jid.to_string(),
            rx,
        }
    }

    /// Feed a stanza into the server as if this client sent it.
    pub async fn send(&self, server: &Arc<Server>, xml: &str) {
        let stanza = Stanza::parse(xml).expect("test stanza parses");
        server.handle_from_client(&self.jid, stanza).await;
    }

    /// Collect everything delivered so far.
    pub fn drain(&mut self) -> Vec<Stanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = self.rx.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }

    /// Wait for the next delivered stanza.
    pub async fn recv(&mut self) -> Stanza {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("stanza within timeout")
            .expect("session open")
    }
}

/// Send an initial available presence for a client.
pub async fn go_online(server: &Arc<Server>, client: &TestClient) {
    let presence = format!("<presence xmlns='jabber:client' from='{}'/>", client.jid);
    client.send(server, &presence).await;
}

//! Server core: extension pipeline dispatch and stanza routing.
//!
//! Stanzas enter through [`Server::handle_stanza`] (or
//! [`Server::handle_from_client`] which normalizes the sender first), run
//! through the extension pipeline in priority order until consumed, and are
//! finally routed to a local session or the federation hook.
//!
//! Dispatch is logically single-threaded: injected stanzas go onto a queue
//! that the active dispatcher drains, so a stanza's pipeline run completes
//! before the next synthesized stanza starts.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::PasswordProvider;
use crate::error::XmppError;
use crate::extension::{sort_pipeline, Extension, Handled};
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::registry::{SendResult, SessionRegistry};
use crate::routing::{destination, pick_resource, RoutingDestination};
use crate::stanza::Stanza;
use crate::storage::Storage;
use crate::util::jid_to_bare;

/// Builder for a [`Server`].
pub struct ServerBuilder {
    domain: String,
    storage: Arc<dyn Storage>,
    passwords: Arc<dyn PasswordProvider>,
    metrics: Metrics,
    extensions: Vec<Arc<dyn Extension>>,
}

impl ServerBuilder {
    /// Start building a server for a domain.
    pub fn new(
        domain: impl Into<String>,
        storage: Arc<dyn Storage>,
        passwords: Arc<dyn PasswordProvider>,
    ) -> Self {
        Self {
            domain: domain.into(),
            storage,
            passwords,
            metrics: Metrics::disabled(),
            extensions: Vec::new(),
        }
    }

    /// Use the given metrics handle.
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register an extension. Registration order breaks priority ties.
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Build the server. Extensions are sorted into pipeline order.
    pub fn build(mut self) -> Arc<Server> {
        sort_pipeline(&mut self.extensions);
        info!(
            domain = %self.domain,
            extensions = ?self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "assembled extension pipeline"
        );
        Arc::new_cyclic(|self_weak| Server {
            domain: self.domain,
            storage: self.storage,
            passwords: self.passwords,
            metrics: self.metrics,
            sessions: SessionRegistry::new(),
            presence: PresenceStore::new(),
            extensions: self.extensions,
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            federation: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }
}

/// The XMPP server core.
pub struct Server {
    domain: String,
    storage: Arc<dyn Storage>,
    passwords: Arc<dyn PasswordProvider>,
    metrics: Metrics,
    sessions: SessionRegistry,
    presence: PresenceStore,
    extensions: Vec<Arc<dyn Extension>>,
    pending: Mutex<VecDeque<Stanza>>,
    dispatching: AtomicBool,
    federation: Mutex<Option<mpsc::Sender<Stanza>>>,
    self_weak: std::sync::Weak<Server>,
}

impl Server {
    /// The served XMPP domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Presence tables.
    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Password provider.
    pub fn passwords(&self) -> &Arc<dyn PasswordProvider> {
        &self.passwords
    }

    /// Metrics handle.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Registered extensions in pipeline order.
    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        &self.extensions
    }

    /// Install the federation transport hook. Stanzas for other domains are
    /// forwarded there; without a hook they are dropped.
    pub fn set_federation(&self, sender: mpsc::Sender<Stanza>) {
        *self.federation.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    /// Start every extension.
    pub async fn start(&self) -> Result<(), XmppError> {
        let this = self
            .self_weak
            .upgrade()
            .ok_or_else(|| XmppError::internal("server already dropped"))?;
        for extension in &self.extensions {
            extension.start(&this).await?;
            debug!(extension = extension.name(), "extension started");
        }
        Ok(())
    }

    /// Stop every extension.
    pub async fn stop(&self) {
        for extension in &self.extensions {
            extension.stop().await;
        }
    }

    /// Union of every extension's presence subscribers for a JID.
    pub async fn collect_presence_subscribers(
        &self,
        jid: &str,
    ) -> std::collections::HashSet<String> {
        let mut subscribers = std::collections::HashSet::new();
        for extension in &self.extensions {
            subscribers.extend(extension.presence_subscribers(self, jid).await);
        }
        subscribers
    }

    /// Union of every extension's presence subscriptions for a JID.
    pub async fn collect_presence_subscriptions(
        &self,
        jid: &str,
    ) -> std::collections::HashSet<String> {
        let mut subscriptions = std::collections::HashSet::new();
        for extension in &self.extensions {
            subscriptions.extend(extension.presence_subscriptions(self, jid).await);
        }
        subscriptions
    }

    /// Entry point for stanzas arriving on a client session. Stamps the
    /// authenticated sender and defaults a missing recipient to the domain.
    pub async fn handle_from_client(&self, session_jid: &str, mut stanza: Stanza) {
        let from = stanza.from();
        if from.is_empty() || jid_to_bare(from) != jid_to_bare(session_jid) {
            stanza.set_from(session_jid);
        }
        if stanza.to().is_empty() {
            stanza.set_to(&self.domain);
        }
        self.handle_stanza(stanza).await;
    }

    /// Queue a stanza for pipeline processing without draining. Only valid
    /// from inside pipeline or lifecycle callbacks; the active dispatcher
    /// picks it up before returning.
    pub fn inject(&self, stanza: Stanza) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(stanza);
    }

    /// Run a stanza through the extension pipeline, then route it if no
    /// extension consumed it. Also drains any stanzas injected meanwhile.
    pub async fn handle_stanza(&self, stanza: Stanza) {
        self.inject(stanza);
        self.drain().await;
    }

    async fn drain(&self) {
        // single dispatcher at a time keeps pipeline runs sequential
        if self
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        loop {
            let next = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match next {
                Some(stanza) => self.process_one(stanza).await,
                None => {
                    self.dispatching.store(false, Ordering::Release);
                    // a concurrent inject may have raced the flag reset
                    let raced = !self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .is_empty();
                    if raced
                        && self
                            .dispatching
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    async fn process_one(&self, mut stanza: Stanza) {
        debug!(
            kind = %stanza.kind(),
            from = stanza.from(),
            to = stanza.to(),
            "dispatching stanza"
        );
        for extension in &self.extensions {
            match extension.handle_stanza(self, &mut stanza).await {
                Ok(Handled::Consumed) => {
                    return;
                }
                Ok(Handled::Pass) => {}
                Err(e) => {
                    // invariant violation; abort the stanza with no reply
                    warn!(
                        extension = extension.name(),
                        error = %e,
                        from = stanza.from(),
                        to = stanza.to(),
                        "extension failed, aborting stanza"
                    );
                    return;
                }
            }
        }
        self.route(stanza).await;
    }

    /// Route a stanza directly to its recipient, bypassing the pipeline.
    /// Returns whether it was handed to a session or the federation hook.
    pub async fn send_packet(&self, stanza: Stanza) -> bool {
        self.route(stanza).await
    }

    async fn route(&self, stanza: Stanza) -> bool {
        let to = stanza.to().to_string();
        if to.is_empty() {
            debug!("dropping stanza without recipient");
            return false;
        }
        match destination(&self.domain, &to) {
            RoutingDestination::Server => {
                debug!(to = %to, "dropping unhandled stanza for the server");
                false
            }
            RoutingDestination::Remote(remote_domain) => {
                let sender = self
                    .federation
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match sender {
                    Some(sender) => sender.send(stanza).await.is_ok(),
                    None => {
                        debug!(domain = %remote_domain, "no federation transport, dropping");
                        false
                    }
                }
            }
            RoutingDestination::LocalResource(full_jid) => {
                self.deliver_to_resource(&full_jid, stanza).await
            }
            RoutingDestination::LocalBare(bare_jid) => {
                match pick_resource(&self.sessions, &self.presence, &bare_jid) {
                    Some(full_jid) => self.deliver_to_resource(&full_jid, stanza).await,
                    None => {
                        debug!(to = %bare_jid, "recipient has no live resources");
                        false
                    }
                }
            }
        }
    }

    async fn deliver_to_resource(&self, full_jid: &str, stanza: Stanza) -> bool {
        match self.sessions.send_to(full_jid, stanza) {
            SendResult::Sent => true,
            SendResult::NotConnected => {
                debug!(to = %full_jid, "recipient resource not connected");
                false
            }
            SendResult::ChannelFull | SendResult::ChannelClosed => {
                // a backed-up or dead outbox means a dead session
                warn!(to = %full_jid, "closing session with dead outbox");
                self.close_session(full_jid).await;
                false
            }
        }
    }

    /// Bind a client session and announce it to extensions. The JID must
    /// be a well-formed full JID; the acceptor authenticated it already.
    pub async fn bind_session(
        &self,
        full_jid: &str,
        sender: mpsc::Sender<Stanza>,
        remote_addr: Option<SocketAddr>,
    ) {
        if full_jid.parse::<jid::FullJid>().is_err() {
            warn!(jid = %full_jid, "refusing to bind a malformed session JID");
            return;
        }
        self.sessions.bind(full_jid, sender, remote_addr);
        self.metrics
            .set_gauge("server.client.count", self.sessions.count() as i64);
        for extension in &self.extensions {
            extension.client_connected(self, full_jid).await;
        }
        self.drain().await;
    }

    /// Close a client session and announce it to extensions. Triggers
    /// presence synthesis for sessions that vanished without unavailable.
    pub async fn close_session(&self, full_jid: &str) {
        if !self.sessions.unbind(full_jid) {
            return;
        }
        self.metrics
            .set_gauge("server.client.count", self.sessions.count() as i64);
        for extension in &self.extensions {
            extension.client_disconnected(self, full_jid).await;
        }
        // boxed: close_session is reachable from inside drain itself
        Box::pin(self.drain()).await;
    }
}

//! Presence engine.
//!
//! Records available presence per resource, fans broadcast presence out to
//! subscribers, answers initial presences with probes or cached presences,
//! tracks directed presence, and synthesizes `unavailable` when a session
//! drops without saying goodbye.

mod store;

pub use store::PresenceStore;

use async_trait::async_trait;
use tracing::debug;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{Stanza, StanzaKind};
use crate::util::{jid_to_bare, jid_to_domain};

/// The presence engine extension.
///
/// Runs last in the pipeline (priority −1000) so that roster rewriting and
/// privacy filtering have already happened: a peer that never subscribed is
/// never recorded as a presence subscriber.
pub struct PresenceExtension;

impl PresenceExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PresenceExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for PresenceExtension {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn priority(&self) -> i32 {
        -1000
    }

    async fn presence_subscribers(
        &self,
        server: &Server,
        jid: &str,
    ) -> std::collections::HashSet<String> {
        server.presence().directed_targets(jid)
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Presence {
            return Ok(Handled::Pass);
        }

        let domain = server.domain();
        let from = stanza.from().to_string();
        let to = stanza.to().to_string();
        let presence_type = stanza.type_attr().to_string();

        if to == domain {
            // broadcast presence to the local domain; only available and
            // unavailable presences from local users are of interest
            if (!presence_type.is_empty() && presence_type != "unavailable")
                || jid_to_domain(&from) != domain
            {
                return Ok(Handled::Consumed);
            }

            let store = server.presence();
            let mut is_initial = false;
            if presence_type.is_empty() {
                is_initial = store.record_available(&from, stanza.clone());
            } else {
                store.remove_available(&from);
                // the sender is presence-wise gone; forget its directed
                // targets once the broadcast below has used them
            }

            // on the initial presence, learn about our subscriptions:
            // probe remote ones, replay cached presences for local ones
            if is_initial {
                for subscription in server.collect_presence_subscriptions(&from).await {
                    if jid_to_domain(&subscription) != domain {
                        let mut probe = Stanza::presence_type("probe");
                        probe.set_from(&from);
                        probe.set_to(&subscription);
                        server.send_packet(probe).await;
                    } else {
                        for mut push in store.available_presences(jid_to_bare(&subscription)) {
                            push.set_to(&from);
                            server.send_packet(push).await;
                        }
                    }
                }
            }

            // fan out to subscribers through the pipeline so downstream
            // extensions see the copies
            for subscriber in server.collect_presence_subscribers(&from).await {
                if subscriber == to {
                    continue;
                }
                let mut copy = stanza.clone();
                copy.set_to(&subscriber);
                server.inject(copy);
            }

            if !presence_type.is_empty() {
                store.directed_take_all(&from);
            }

            Ok(Handled::Consumed)
        } else {
            // directed presence; track it but let it route normally
            let store = server.presence();
            if (presence_type.is_empty() || presence_type == "unavailable")
                && jid_to_domain(&from) == domain
            {
                if presence_type.is_empty() {
                    store.directed_insert(&from, &to);
                } else {
                    store.directed_remove(&from, &to);
                }
            } else if presence_type == "error" && jid_to_domain(&to) == domain {
                store.directed_remove(&to, &from);
            }
            Ok(Handled::Pass)
        }
    }

    async fn client_disconnected(&self, server: &Server, jid: &str) {
        let store = server.presence();
        if store.has_available(jid) {
            // the client sent an initial available presence but no
            // unavailable; synthesize one and run it through the pipeline
            // so subscribers and the roster engine react normally
            debug!(jid, "synthesizing unavailable presence");
            let mut presence = Stanza::presence_type("unavailable");
            presence.set_from(jid);
            presence.set_to(server.domain());
            server.inject(presence);
        } else {
            // no broadcast presence; notify directed-presence targets
            for target in store.directed_take_all(jid) {
                let mut presence = Stanza::presence_type("unavailable");
                presence.set_from(jid);
                presence.set_to(&target);
                server.inject(presence);
            }
        }
    }
}

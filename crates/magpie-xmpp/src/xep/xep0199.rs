//! XEP-0199: XMPP Ping.

use async_trait::async_trait;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};

/// The ping responder.
pub struct PingExtension;

impl PingExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PingExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for PingExtension {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq
            || stanza.to() != server.domain()
            || stanza.type_attr() != "get"
            || stanza.child("ping", ns::PING).is_none()
        {
            return Ok(Handled::Pass);
        }
        server.send_packet(stanza.result_for()).await;
        Ok(Handled::Consumed)
    }
}

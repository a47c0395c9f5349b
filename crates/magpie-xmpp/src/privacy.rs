//! Contact-gated message filter.
//!
//! When enabled, chat messages to a local user are dropped unless the
//! sender holds a From subscription in the recipient's roster. Runs at
//! priority +1 so dropped messages never reach the archive.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::roster::SubscriptionBits;
use crate::server::Server;
use crate::stanza::{Stanza, StanzaKind};
use crate::storage::Storage;
use crate::util::{jid_to_bare, jid_to_domain};

/// Privacy filter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivacyConfig {
    /// Whether the filter is active.
    #[serde(default)]
    pub enabled: bool,
}

/// The privacy filter extension.
pub struct PrivacyExtension {
    config: PrivacyConfig,
}

impl PrivacyExtension {
    /// Create the extension.
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Extension for PrivacyExtension {
    fn name(&self) -> &'static str {
        "privacy"
    }

    fn priority(&self) -> i32 {
        // ahead of the archive so dropped messages are not stored
        1
    }

    fn discovery_features(&self) -> Vec<String> {
        vec!["jabber:iq:privacy".to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if !self.config.enabled
            || stanza.kind() != StanzaKind::Message
            || matches!(stanza.type_attr(), "error" | "groupchat" | "headline")
        {
            return Ok(Handled::Pass);
        }

        let domain = server.domain();
        let to = stanza.to();
        if jid_to_domain(to) != domain || jid_to_bare(to) == domain {
            return Ok(Handled::Pass);
        }

        let recipient = jid_to_bare(to);
        let sender = jid_to_bare(stanza.from());
        let allowed = server
            .storage()
            .roster_contact(recipient, sender)
            .await?
            .map(|contact| contact.subscription.has(SubscriptionBits::FROM))
            .unwrap_or(false);

        if allowed {
            Ok(Handled::Pass)
        } else {
            warn!(from = sender, to = recipient, "dropping message from stranger");
            Ok(Handled::Consumed)
        }
    }
}

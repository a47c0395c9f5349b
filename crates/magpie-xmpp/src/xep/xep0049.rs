//! XEP-0049: Private XML Storage.
//!
//! Users store one opaque payload element per namespace. A get for a
//! namespace with no stored data echoes the request payload back, which is
//! how clients learn there is nothing yet.

use async_trait::async_trait;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::storage::Storage;
use crate::util::{jid_to_bare, jid_to_domain};

/// The private storage extension.
pub struct PrivateStorageExtension;

impl PrivateStorageExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PrivateStorageExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for PrivateStorageExtension {
    fn name(&self) -> &'static str {
        "private"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::PRIVATE.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq || stanza.to() != server.domain() {
            return Ok(Handled::Pass);
        }
        if jid_to_domain(stanza.from()) != server.domain() {
            return Ok(Handled::Pass);
        }
        let Some(query) = stanza.child("query", ns::PRIVATE).cloned() else {
            return Ok(Handled::Pass);
        };

        // the payload's namespace is the storage key; a payload that fell
        // back to the query namespace has none
        let payload = query.children().next().cloned();
        let namespace = payload.as_ref().map(|p| p.ns());
        let (payload, namespace) = match (payload, namespace) {
            (Some(payload), Some(namespace))
                if !namespace.is_empty() && namespace != ns::PRIVATE =>
            {
                (payload, namespace)
            }
            _ => {
                let reply = stanza
                    .error_reply(StanzaErrorType::Modify, StanzaErrorCondition::BadRequest);
                server.send_packet(reply).await;
                return Ok(Handled::Consumed);
            }
        };

        let owner = jid_to_bare(stanza.from()).to_string();
        match stanza.type_attr() {
            "get" => {
                let stored = server.storage().private_xml(&owner, &namespace).await?;
                let inner = stored
                    .and_then(|xml| xml.parse::<Element>().ok())
                    .unwrap_or(payload);
                let mut response = stanza.result_for();
                response.append(
                    Element::builder("query", ns::PRIVATE).append(inner).build(),
                );
                server.send_packet(response).await;
            }
            "set" => {
                server
                    .storage()
                    .set_private_xml(&owner, &namespace, &String::from(&payload))
                    .await?;
                server.send_packet(stanza.result_for()).await;
            }
            _ => {}
        }
        Ok(Handled::Consumed)
    }
}

//! XEP-0054: vcard-temp.

use async_trait::async_trait;
use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::storage::Storage;
use crate::util::{jid_to_bare, jid_to_domain, jid_to_resource};

/// The vCard extension.
pub struct VcardExtension;

impl VcardExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for VcardExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for VcardExtension {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::VCARD.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq {
            return Ok(Handled::Pass);
        }
        let domain = server.domain();
        let to = stanza.to();
        let addressed_here =
            to == domain || (jid_to_domain(to) == domain && jid_to_resource(to).is_empty());
        if !addressed_here || stanza.child("vCard", ns::VCARD).is_none() {
            return Ok(Handled::Pass);
        }

        match stanza.type_attr() {
            "get" => {
                let target = if to == domain {
                    jid_to_bare(stanza.from()).to_string()
                } else {
                    to.to_string()
                };
                match server.storage().vcard(&target).await? {
                    Some(xml) => {
                        let mut response = stanza.result_for();
                        match xml.parse::<Element>() {
                            Ok(vcard) => response.append(vcard),
                            Err(_) => {
                                response
                                    .append(Element::builder("vCard", ns::VCARD).build());
                            }
                        }
                        server.send_packet(response).await;
                    }
                    None => {
                        let reply = stanza.error_reply(
                            StanzaErrorType::Cancel,
                            StanzaErrorCondition::ItemNotFound,
                        );
                        server.send_packet(reply).await;
                    }
                }
            }
            "set" => {
                // users may only publish their own card
                if to != domain && jid_to_bare(stanza.from()) != to {
                    let reply = stanza.error_reply(
                        StanzaErrorType::Auth,
                        StanzaErrorCondition::Forbidden,
                    );
                    server.send_packet(reply).await;
                    return Ok(Handled::Consumed);
                }
                let owner = jid_to_bare(stanza.from()).to_string();
                if let Some(vcard) = stanza.child("vCard", ns::VCARD) {
                    server
                        .storage()
                        .set_vcard(&owner, &String::from(vcard))
                        .await?;
                }
                server.send_packet(stanza.result_for()).await;
            }
            _ => {}
        }
        Ok(Handled::Consumed)
    }
}

//! XEP-0092: Software Version.

use async_trait::async_trait;
use minidom::Element;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};

/// The software version responder.
pub struct VersionExtension;

impl VersionExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for VersionExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for VersionExtension {
    fn name(&self) -> &'static str {
        "version"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::VERSION.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq
            || stanza.to() != server.domain()
            || stanza.type_attr() != "get"
            || stanza.child("query", ns::VERSION).is_none()
        {
            return Ok(Handled::Pass);
        }

        let query = Element::builder("query", ns::VERSION)
            .append(
                Element::builder("name", ns::VERSION)
                    .append(crate::disco::SERVER_NAME)
                    .build(),
            )
            .append(
                Element::builder("version", ns::VERSION)
                    .append(env!("CARGO_PKG_VERSION"))
                    .build(),
            )
            .append(
                Element::builder("os", ns::VERSION)
                    .append(std::env::consts::OS)
                    .build(),
            )
            .build();
        let mut response = stanza.result_for();
        response.append(query);
        server.send_packet(response).await;
        Ok(Handled::Consumed)
    }
}

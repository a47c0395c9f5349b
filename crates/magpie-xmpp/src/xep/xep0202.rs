//! XEP-0202: Entity Time.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use minidom::Element;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};

/// The entity time responder. Always answers in UTC.
pub struct TimeExtension;

impl TimeExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TimeExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for TimeExtension {
    fn name(&self) -> &'static str {
        "time"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::TIME.to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq
            || stanza.to() != server.domain()
            || stanza.type_attr() != "get"
            || stanza.child("time", ns::TIME).is_none()
        {
            return Ok(Handled::Pass);
        }

        let time = Element::builder("time", ns::TIME)
            .append(Element::builder("tzo", ns::TIME).append("+00:00").build())
            .append(
                Element::builder("utc", ns::TIME)
                    .append(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
                    .build(),
            )
            .build();
        let mut response = stanza.result_for();
        response.append(time);
        server.send_packet(response).await;
        Ok(Handled::Consumed)
    }
}

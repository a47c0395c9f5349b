//! Service discovery (XEP-0030).
//!
//! Answers disco#info and disco#items queries addressed to the bare domain
//! by aggregating the features and items every registered extension
//! advertises. Duplicate features are tolerated.

use async_trait::async_trait;
use minidom::Element;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};

/// Server software name advertised in the disco identity.
pub const SERVER_NAME: &str = "magpie";

/// The disco aggregation extension.
pub struct DiscoExtension;

impl DiscoExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DiscoExtension {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a disco#info result element with an identity and features.
pub fn build_info(category: &str, item_type: &str, name: &str, features: &[String]) -> Element {
    let identity = Element::builder("identity", ns::DISCO_INFO)
        .attr("category", category)
        .attr("type", item_type)
        .attr("name", name)
        .build();
    let mut query = Element::builder("query", ns::DISCO_INFO).append(identity);
    for feature in features {
        query = query.append(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", feature.as_str())
                .build(),
        );
    }
    query.build()
}

/// Build a disco#items result element from (jid, optional name) pairs.
pub fn build_items(items: &[(String, Option<String>)]) -> Element {
    let mut query = Element::builder("query", ns::DISCO_ITEMS);
    for (jid, name) in items {
        let mut item = Element::builder("item", ns::DISCO_ITEMS).attr("jid", jid.as_str());
        if let Some(name) = name {
            item = item.attr("name", name.as_str());
        }
        query = query.append(item.build());
    }
    query.build()
}

/// Whether an IQ carries a disco query, and which kind.
pub fn disco_query_kind(stanza: &Stanza) -> Option<&'static str> {
    if stanza.child("query", ns::DISCO_INFO).is_some() {
        Some("info")
    } else if stanza.child("query", ns::DISCO_ITEMS).is_some() {
        Some("items")
    } else {
        None
    }
}

#[async_trait]
impl Extension for DiscoExtension {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![
            ns::DISCO_INFO.to_string(),
            ns::DISCO_ITEMS.to_string(),
            ns::RSM.to_string(),
        ]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq
            || stanza.to() != server.domain()
            || stanza.type_attr() != "get"
        {
            return Ok(Handled::Pass);
        }
        let Some(kind) = disco_query_kind(stanza) else {
            return Ok(Handled::Pass);
        };

        let mut response = stanza.result_for();
        if kind == "items" {
            let mut items = Vec::new();
            for extension in server.extensions() {
                for jid in extension.discovery_items() {
                    items.push((jid, None));
                }
            }
            response.append(build_items(&items));
        } else {
            let mut features = Vec::new();
            for extension in server.extensions() {
                features.extend(extension.discovery_features());
            }
            response.append(build_info("server", "im", SERVER_NAME, &features));
        }
        server.send_packet(response).await;
        Ok(Handled::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_element_shape() {
        let info = build_info(
            "server",
            "im",
            "magpie",
            &[ns::DISCO_INFO.to_string(), ns::ROSTER.to_string()],
        );
        assert_eq!(info.name(), "query");
        let identity = info.get_child("identity", ns::DISCO_INFO).unwrap();
        assert_eq!(identity.attr("category"), Some("server"));
        let features: Vec<&str> = info
            .children()
            .filter(|c| c.name() == "feature")
            .filter_map(|c| c.attr("var"))
            .collect();
        assert_eq!(features, vec![ns::DISCO_INFO, ns::ROSTER]);
    }

    #[test]
    fn items_element_shape() {
        let items = build_items(&[
            ("conference.x.com".to_string(), None),
            ("shares.x.com".to_string(), Some("Shares".to_string())),
        ]);
        let jids: Vec<&str> = items
            .children()
            .filter_map(|c| c.attr("jid"))
            .collect();
        assert_eq!(jids, vec!["conference.x.com", "shares.x.com"]);
    }

    #[test]
    fn query_kind_detection() {
        let mut iq = Stanza::iq("get", "d1");
        iq.append(Element::builder("query", ns::DISCO_INFO).build());
        assert_eq!(disco_query_kind(&iq), Some("info"));

        let mut iq = Stanza::iq("get", "d2");
        iq.append(Element::builder("query", ns::DISCO_ITEMS).build());
        assert_eq!(disco_query_kind(&iq), Some("items"));

        assert_eq!(disco_query_kind(&Stanza::iq("get", "d3")), None);
    }
}

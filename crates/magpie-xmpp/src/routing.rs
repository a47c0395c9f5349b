//! Routing decisions for stanzas the pipeline did not consume.
//!
//! The router only distinguishes local users from out-of-domain recipients;
//! component subdomains (conference, shares, proxy) are consumed by their
//! extensions before routing is reached.

use crate::presence::PresenceStore;
use crate::registry::SessionRegistry;
use crate::util::{jid_to_domain, jid_to_resource};

/// Where an unconsumed stanza should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDestination {
    /// Addressed to the server itself; dropped if nothing consumed it.
    Server,
    /// A full JID of a local user.
    LocalResource(String),
    /// A bare JID of a local user.
    LocalBare(String),
    /// An out-of-domain recipient, forwarded to federation or dropped.
    Remote(String),
}

/// Classify a recipient JID relative to the local domain.
pub fn destination(local_domain: &str, to: &str) -> RoutingDestination {
    let domain = jid_to_domain(to);
    if domain != local_domain {
        return RoutingDestination::Remote(domain.to_string());
    }
    if to == local_domain || crate::util::jid_to_bare(to) == local_domain {
        return RoutingDestination::Server;
    }
    if jid_to_resource(to).is_empty() {
        RoutingDestination::LocalBare(to.to_string())
    } else {
        RoutingDestination::LocalResource(to.to_string())
    }
}

/// Pick the delivery resource for a bare JID: the highest-priority present
/// resource, tie-broken by the most recently bound session.
pub fn pick_resource(
    sessions: &SessionRegistry,
    presence: &PresenceStore,
    bare_jid: &str,
) -> Option<String> {
    sessions
        .resources_for(bare_jid)
        .into_iter()
        .max_by_key(|full| {
            (
                presence.priority_of(full).unwrap_or(0),
                sessions.bound_seq(full).unwrap_or(0),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Stanza;
    use tokio::sync::mpsc;

    #[test]
    fn destination_classification() {
        assert_eq!(
            destination("x.com", "user@other.com"),
            RoutingDestination::Remote("other.com".to_string())
        );
        assert_eq!(destination("x.com", "x.com"), RoutingDestination::Server);
        assert_eq!(
            destination("x.com", "user@x.com"),
            RoutingDestination::LocalBare("user@x.com".to_string())
        );
        assert_eq!(
            destination("x.com", "user@x.com/home"),
            RoutingDestination::LocalResource("user@x.com/home".to_string())
        );
        // a conference subdomain is a different domain as far as the
        // router is concerned
        assert_eq!(
            destination("x.com", "room@conference.x.com"),
            RoutingDestination::Remote("conference.x.com".to_string())
        );
    }

    #[test]
    fn pick_resource_prefers_priority_then_recency() {
        let sessions = SessionRegistry::new();
        let presence = PresenceStore::new();
        let (tx, _rx) = mpsc::channel(8);
        sessions.bind("a@x.com/low", tx.clone(), None);
        sessions.bind("a@x.com/high", tx.clone(), None);

        let low = Stanza::parse(
            "<presence xmlns='jabber:client' from='a@x.com/low'><priority>1</priority></presence>",
        )
        .unwrap();
        let high = Stanza::parse(
            "<presence xmlns='jabber:client' from='a@x.com/high'><priority>5</priority></presence>",
        )
        .unwrap();
        presence.record_available("a@x.com/low", low);
        presence.record_available("a@x.com/high", high);

        assert_eq!(
            pick_resource(&sessions, &presence, "a@x.com"),
            Some("a@x.com/high".to_string())
        );

        // equal priorities fall back to the most recent bind
        let sessions = SessionRegistry::new();
        let presence = PresenceStore::new();
        sessions.bind("b@x.com/first", tx.clone(), None);
        sessions.bind("b@x.com/second", tx, None);
        assert_eq!(
            pick_resource(&sessions, &presence, "b@x.com"),
            Some("b@x.com/second".to_string())
        );
    }
}

//! Extension framework.
//!
//! Every stanza entering the server is offered to each registered extension
//! in priority order (larger runs earlier, ties broken by registration
//! order) until one consumes it. Extensions also contribute service
//! discovery data and presence subscription sets, and get notified of
//! session lifecycle events.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::XmppError;
use crate::server::Server;
use crate::stanza::Stanza;

/// Outcome of offering a stanza to an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The extension consumed the stanza; no further processing.
    Consumed,
    /// The stanza passes to the next extension (and finally the router).
    Pass,
}

/// A pluggable server extension.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Unique extension name, used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Pipeline priority. Larger values run earlier; the default is 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Called once when the server starts. Extensions spawn their
    /// background tasks here, holding a clone of the server handle.
    async fn start(&self, _server: &Arc<Server>) -> Result<(), XmppError> {
        Ok(())
    }

    /// Called once during shutdown.
    async fn stop(&self) {}

    /// Feature namespaces advertised in disco#info on the bare domain.
    fn discovery_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Item JIDs advertised in disco#items on the bare domain.
    fn discovery_items(&self) -> Vec<String> {
        Vec::new()
    }

    /// JIDs subscribed to `jid`'s presence, contributed by this extension.
    async fn presence_subscribers(&self, _server: &Server, _jid: &str) -> HashSet<String> {
        HashSet::new()
    }

    /// JIDs whose presence `jid` is subscribed to, contributed by this
    /// extension.
    async fn presence_subscriptions(&self, _server: &Server, _jid: &str) -> HashSet<String> {
        HashSet::new()
    }

    /// Offer a stanza to this extension. The stanza is mutable so an
    /// extension may rewrite addressing before passing it on.
    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError>;

    /// A client session reached the live state.
    async fn client_connected(&self, _server: &Server, _jid: &str) {}

    /// A client session went away.
    async fn client_disconnected(&self, _server: &Server, _jid: &str) {}
}

/// Sort extensions into pipeline order: priority descending, stable for
/// ties so registration order decides.
pub(crate) fn sort_pipeline(extensions: &mut [Arc<dyn Extension>]) {
    extensions.sort_by_key(|e| std::cmp::Reverse(e.priority()));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str, i32);

    #[async_trait]
    impl Extension for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        async fn handle_stanza(
            &self,
            _server: &Server,
            _stanza: &mut Stanza,
        ) -> Result<Handled, XmppError> {
            Ok(Handled::Pass)
        }
    }

    #[test]
    fn pipeline_order_is_priority_then_registration() {
        let mut extensions: Vec<Arc<dyn Extension>> = vec![
            Arc::new(Dummy("archive", 0)),
            Arc::new(Dummy("privacy", 1)),
            Arc::new(Dummy("presence", -1000)),
            Arc::new(Dummy("roster", 0)),
        ];
        sort_pipeline(&mut extensions);
        let names: Vec<&str> = extensions.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["privacy", "archive", "roster", "presence"]);
    }
}

//! Session registry implementation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::stanza::Stanza;
use crate::util::jid_to_bare;

/// Outbound channel capacity per session; a session that falls this far
/// behind is closed rather than buffered further.
pub const OUTBOX_CAPACITY: usize = 256;

/// Result of attempting to enqueue a stanza on a session outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Stanza was queued for delivery
    Sent,
    /// No session is bound for that full JID
    NotConnected,
    /// The outbox hit its high-water mark
    ChannelFull,
    /// The session dropped its receiving end
    ChannelClosed,
}

struct SessionHandle {
    sender: mpsc::Sender<Stanza>,
    bound_seq: u64,
    remote_addr: Option<SocketAddr>,
}

/// A bound session as reported to the admin surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Full JID of the session
    pub full_jid: String,
    /// Remote socket address, when the acceptor reported one
    pub remote_addr: Option<SocketAddr>,
}

/// Registry of bound sessions.
///
/// Maps full JIDs to outbound channels and maintains a bare-JID index so
/// the router can enumerate a user's live resources.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    resources: DashMap<String, HashSet<String>>,
    bind_seq: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            resources: DashMap::new(),
            bind_seq: AtomicU64::new(0),
        }
    }

    /// Bind a session. An existing binding for the same full JID is
    /// replaced, which covers reconnects that beat the old session's
    /// teardown.
    #[instrument(skip(self, sender, remote_addr), fields(jid = %full_jid))]
    pub fn bind(
        &self,
        full_jid: &str,
        sender: mpsc::Sender<Stanza>,
        remote_addr: Option<SocketAddr>,
    ) {
        let bound_seq = self.bind_seq.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .sessions
            .insert(
                full_jid.to_string(),
                SessionHandle {
                    sender,
                    bound_seq,
                    remote_addr,
                },
            )
            .is_some();
        self.resources
            .entry(jid_to_bare(full_jid).to_string())
            .or_default()
            .insert(full_jid.to_string());
        if replaced {
            debug!("replaced existing session binding");
        } else {
            debug!("bound new session");
        }
    }

    /// Unbind a session. Returns whether it was bound.
    #[instrument(skip(self), fields(jid = %full_jid))]
    pub fn unbind(&self, full_jid: &str) -> bool {
        let removed = self.sessions.remove(full_jid).is_some();
        let bare = jid_to_bare(full_jid).to_string();
        if let Some(mut entry) = self.resources.get_mut(&bare) {
            entry.remove(full_jid);
            if entry.is_empty() {
                drop(entry);
                self.resources.remove(&bare);
            }
        }
        removed
    }

    /// Whether a full JID has a bound session.
    pub fn is_connected(&self, full_jid: &str) -> bool {
        self.sessions.contains_key(full_jid)
    }

    /// Live resources of a bare JID, as full JIDs.
    pub fn resources_for(&self, bare_jid: &str) -> Vec<String> {
        self.resources
            .get(bare_jid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Bind sequence number of a session; larger means bound later.
    pub fn bound_seq(&self, full_jid: &str) -> Option<u64> {
        self.sessions.get(full_jid).map(|h| h.bound_seq)
    }

    /// Enqueue a stanza on a session outbox without blocking.
    pub fn send_to(&self, full_jid: &str, stanza: Stanza) -> SendResult {
        let sender = match self.sessions.get(full_jid) {
            Some(handle) => handle.sender.clone(),
            None => return SendResult::NotConnected,
        };
        match sender.try_send(stanza) {
            Ok(()) => SendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(jid = %full_jid, "session outbox full");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(jid = %full_jid, "session outbox closed");
                SendResult::ChannelClosed
            }
        }
    }

    /// Number of bound sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Every bound session, for the admin surface.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                full_jid: entry.key().clone(),
                remote_addr: entry.value().remote_addr,
            })
            .collect();
        sessions.sort_by(|a, b| a.full_jid.cmp(&b.full_jid));
        sessions
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Stanza>, mpsc::Receiver<Stanza>) {
        mpsc::channel(OUTBOX_CAPACITY)
    }

    #[test]
    fn bind_and_resources() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        registry.bind("alice@x.com/laptop", tx1, None);
        registry.bind("alice@x.com/phone", tx2, None);

        assert!(registry.is_connected("alice@x.com/laptop"));
        let mut resources = registry.resources_for("alice@x.com");
        resources.sort();
        assert_eq!(
            resources,
            vec!["alice@x.com/laptop".to_string(), "alice@x.com/phone".to_string()]
        );
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn unbind_cleans_bare_index() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        registry.bind("alice@x.com/laptop", tx, None);
        assert!(registry.unbind("alice@x.com/laptop"));
        assert!(!registry.unbind("alice@x.com/laptop"));
        assert!(registry.resources_for("alice@x.com").is_empty());
    }

    #[test]
    fn bound_seq_orders_binds() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        registry.bind("a@x.com/one", tx1, None);
        registry.bind("a@x.com/two", tx2, None);
        assert!(registry.bound_seq("a@x.com/two") > registry.bound_seq("a@x.com/one"));
    }

    #[tokio::test]
    async fn send_to_delivers() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = channel();
        registry.bind("a@x.com/r", tx, None);

        let mut stanza = Stanza::message("chat");
        stanza.set_to("a@x.com/r");
        assert_eq!(registry.send_to("a@x.com/r", stanza), SendResult::Sent);
        assert!(rx.recv().await.is_some());

        assert_eq!(
            registry.send_to("nobody@x.com/r", Stanza::presence()),
            SendResult::NotConnected
        );
    }

    #[test]
    fn full_outbox_reports_high_water() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.bind("a@x.com/r", tx, None);
        assert_eq!(registry.send_to("a@x.com/r", Stanza::presence()), SendResult::Sent);
        assert_eq!(
            registry.send_to("a@x.com/r", Stanza::presence()),
            SendResult::ChannelFull
        );
    }
}

//! Diagnostics probes.
//!
//! Keeps a per-bare-JID record of ping round-trips, refreshed on request
//! from the admin HTTP surface. A refresh sends a ping IQ to the user; the
//! matching result or error updates the record.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};

/// A diagnostics probe record.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    /// Probed bare JID.
    pub jid: String,
    /// Last measured round-trip, if any.
    pub last_rtt_ms: Option<u64>,
    /// When the last reply arrived.
    pub last_seen: Option<DateTime<Utc>>,
}

struct PendingProbe {
    jid: String,
    sent_at: Instant,
}

/// The diagnostics extension.
pub struct DiagExtension {
    probes: DashMap<String, ProbeRecord>,
    pending: DashMap<String, PendingProbe>,
}

impl DiagExtension {
    /// Create the extension.
    pub fn new() -> Self {
        Self {
            probes: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// All probe records.
    pub fn list(&self) -> Vec<ProbeRecord> {
        let mut probes: Vec<ProbeRecord> =
            self.probes.iter().map(|entry| entry.value().clone()).collect();
        probes.sort_by(|a, b| a.jid.cmp(&b.jid));
        probes
    }

    /// One probe record.
    pub fn get(&self, jid: &str) -> Option<ProbeRecord> {
        self.probes.get(jid).map(|entry| entry.value().clone())
    }

    /// Drop a probe record. Returns whether it existed.
    pub fn remove(&self, jid: &str) -> bool {
        self.probes.remove(jid).is_some()
    }

    /// Create or refresh a probe by pinging the user.
    pub async fn refresh(&self, server: &Server, jid: &str) {
        self.probes
            .entry(jid.to_string())
            .or_insert_with(|| ProbeRecord {
                jid: jid.to_string(),
                last_rtt_ms: None,
                last_seen: None,
            });
        let id = Uuid::new_v4().to_string();
        self.pending.insert(
            id.clone(),
            PendingProbe {
                jid: jid.to_string(),
                sent_at: Instant::now(),
            },
        );
        let mut ping = Stanza::iq("get", &id);
        ping.set_from(server.domain());
        ping.set_to(jid);
        ping.append(minidom::Element::builder("ping", ns::PING).build());
        server.send_packet(ping).await;
    }
}

impl Default for DiagExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for DiagExtension {
    fn name(&self) -> &'static str {
        "diag"
    }

    fn discovery_features(&self) -> Vec<String> {
        vec![ns::DIAGNOSTICS.to_string()]
    }

    async fn handle_stanza(
        &self,
        _server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.kind() != StanzaKind::Iq
            || !matches!(stanza.type_attr(), "result" | "error")
        {
            return Ok(Handled::Pass);
        }
        let Some((_, pending)) = self.pending.remove(stanza.id()) else {
            return Ok(Handled::Pass);
        };
        if let Some(mut record) = self.probes.get_mut(&pending.jid) {
            if stanza.type_attr() == "result" {
                record.last_rtt_ms = Some(pending.sent_at.elapsed().as_millis() as u64);
                record.last_seen = Some(Utc::now());
            }
        }
        Ok(Handled::Consumed)
    }
}

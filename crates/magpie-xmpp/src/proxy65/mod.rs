//! SOCKS5 bytestream proxy (XEP-0065).
//!
//! Two clients each open a TCP connection to the proxy port and negotiate
//! SOCKS5 with the stream key as the destination host. The first
//! connection for a key becomes the target side, the second the source;
//! an authorized activation IQ then wires the two sockets together.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use minidom::Element;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::{ns, Stanza, StanzaKind};
use crate::util::jid_to_domain;

/// Transfer block size; also bounds the per-direction buffering.
pub const BLOCK_SIZE: usize = 16384;

/// Proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Proxy65Config {
    /// Service JID; defaults to `proxy.<domain>`.
    #[serde(default)]
    pub jid: Option<String>,
    /// Host advertised to clients; defaults to the server domain.
    #[serde(default)]
    pub host: Option<String>,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Domains allowed to use the proxy; defaults to the server domain.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

fn default_port() -> u16 {
    7777
}

impl Default for Proxy65Config {
    fn default() -> Self {
        Self {
            jid: None,
            host: None,
            port: default_port(),
            allowed_domains: Vec::new(),
        }
    }
}

/// Key identifying a bytestream: SHA1(sid + initiator + target), hex.
pub fn stream_hash(sid: &str, initiator: &str, target: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.as_bytes());
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}

enum PairSlot {
    /// Collecting sockets: target connects first, then source.
    Waiting {
        target: Option<TcpStream>,
        source: Option<TcpStream>,
    },
    /// Pumping; further connections for the key are refused.
    Active,
}

struct ProxyInner {
    config: Proxy65Config,
    service_jid: OnceLock<String>,
    advertised_host: OnceLock<String>,
    allowed_domains: OnceLock<Vec<String>>,
    server: OnceLock<Weak<Server>>,
    pairs: Mutex<HashMap<String, PairSlot>>,
    shutdown: CancellationToken,
}

impl ProxyInner {
    fn service_jid(&self) -> &str {
        self.service_jid.get().map(String::as_str).unwrap_or("")
    }

    fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains
            .get()
            .map(|domains| domains.iter().any(|d| d == domain))
            .unwrap_or(false)
    }

    /// File a freshly negotiated socket under its stream key.
    async fn add_socket(&self, key: &str, socket: TcpStream) {
        let mut pairs = self.pairs.lock().await;
        match pairs.entry(key.to_string()).or_insert(PairSlot::Waiting {
            target: None,
            source: None,
        }) {
            PairSlot::Waiting { target, source } => {
                if target.is_none() {
                    debug!(key, "opened target connection");
                    *target = Some(socket);
                } else if source.is_none() {
                    debug!(key, "opened source connection");
                    *source = Some(socket);
                } else {
                    warn!(key, "unexpected extra connection");
                }
            }
            PairSlot::Active => {
                warn!(key, "connection for an active stream");
            }
        }
    }

    /// Wire the two sockets of a pair together. Returns false unless both
    /// sides are present.
    async fn activate(this: &Arc<Self>, key: &str) -> bool {
        let mut pairs = this.pairs.lock().await;
        let Some(slot) = pairs.get_mut(key) else {
            return false;
        };
        let (target, source) = match slot {
            PairSlot::Waiting { target, source } => {
                match (target.take(), source.take()) {
                    (Some(target), Some(source)) => (target, source),
                    (target_opt, source_opt) => {
                        // put back whatever we had
                        *target = target_opt;
                        *source = source_opt;
                        warn!(key, "both connections are needed to activate");
                        return false;
                    }
                }
            }
            PairSlot::Active => return false,
        };
        *slot = PairSlot::Active;
        drop(pairs);

        let inner = Arc::clone(this);
        let key = key.to_string();
        tokio::spawn(async move {
            let transferred = pump_pair(target, source).await;
            info!(key = %key, bytes = transferred, "bytestream finished");
            inner.pairs.lock().await.remove(&key);
            if let Some(server) = inner.server.get().and_then(|weak| weak.upgrade()) {
                server
                    .metrics()
                    .update_counter_by("proxy65.bytes", transferred as i64);
                server.metrics().update_counter("proxy65.transfers");
            }
        });
        true
    }
}

/// Copy in both directions until both sides close; returns total bytes.
async fn pump_pair(target: TcpStream, source: TcpStream) -> u64 {
    let (target_read, target_write) = target.into_split();
    let (source_read, source_write) = source.into_split();
    let a = tokio::spawn(pump_one(source_read, target_write));
    let b = tokio::spawn(pump_one(target_read, source_write));
    let a = a.await.unwrap_or(0);
    let b = b.await.unwrap_or(0);
    a + b
}

/// One direction of the pump. Writes block until the peer drains, which
/// caps buffered data near the block size.
async fn pump_one(
    mut read: tokio::net::tcp::OwnedReadHalf,
    mut write: tokio::net::tcp::OwnedWriteHalf,
) -> u64 {
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut transferred = 0u64;
    loop {
        match read.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if write.write_all(&buffer[..n]).await.is_err() {
                    break;
                }
                transferred += n as u64;
            }
        }
    }
    let _ = write.flush().await;
    let _ = write.shutdown().await;
    transferred
}

/// Run the SOCKS5 negotiation and return the requested destination host.
async fn socks5_negotiate(socket: &mut TcpStream) -> std::io::Result<String> {
    use std::io::{Error, ErrorKind};

    // greeting: version, methods
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Err(Error::new(ErrorKind::InvalidData, "not SOCKS5"));
    }
    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        socket.write_all(&[0x05, 0xff]).await?;
        return Err(Error::new(ErrorKind::InvalidData, "no acceptable method"));
    }
    socket.write_all(&[0x05, 0x00]).await?;

    // request: CONNECT to a domain destination
    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    if request[1] != 0x01 || request[3] != 0x03 {
        socket
            .write_all(&[0x05, 0x07, 0x00, 0x03, 0x00, 0x00, 0x00])
            .await?;
        return Err(Error::new(ErrorKind::InvalidData, "unsupported request"));
    }
    let mut len = [0u8; 1];
    socket.read_exact(&mut len).await?;
    let mut host = vec![0u8; len[0] as usize];
    socket.read_exact(&mut host).await?;
    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;

    // success reply echoing the destination
    let mut reply = vec![0x05, 0x00, 0x00, 0x03, len[0]];
    reply.extend_from_slice(&host);
    reply.extend_from_slice(&port);
    socket.write_all(&reply).await?;

    String::from_utf8(host).map_err(|_| Error::new(ErrorKind::InvalidData, "bad host"))
}

/// The SOCKS5 proxy extension.
pub struct Proxy65Extension {
    inner: Arc<ProxyInner>,
}

impl Proxy65Extension {
    /// Create the extension.
    pub fn new(config: Proxy65Config) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                config,
                service_jid: OnceLock::new(),
                advertised_host: OnceLock::new(),
                allowed_domains: OnceLock::new(),
                server: OnceLock::new(),
                pairs: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    async fn handle_bytestreams_iq(
        &self,
        server: &Server,
        stanza: &Stanza,
        query: &Element,
    ) -> Result<Handled, XmppError> {
        let inner = &self.inner;
        let from = stanza.from().to_string();

        match stanza.type_attr() {
            "get" => {
                // request for the proxy's network address
                if inner.domain_allowed(jid_to_domain(&from)) {
                    let streamhost = Element::builder("streamhost", ns::BYTESTREAMS)
                        .attr("jid", inner.service_jid())
                        .attr(
                            "host",
                            inner
                                .advertised_host
                                .get()
                                .map(String::as_str)
                                .unwrap_or(""),
                        )
                        .attr("port", inner.config.port.to_string())
                        .build();
                    let mut response = stanza.result_for();
                    response.append(
                        Element::builder("query", ns::BYTESTREAMS)
                            .append(streamhost)
                            .build(),
                    );
                    server.send_packet(response).await;
                } else {
                    let reply = stanza
                        .error_reply(StanzaErrorType::Auth, StanzaErrorCondition::Forbidden);
                    server.send_packet(reply).await;
                }
                Ok(Handled::Consumed)
            }
            "set" => {
                let sid = query.attr("sid").unwrap_or("");
                let activate_target = query
                    .get_child("activate", ns::BYTESTREAMS)
                    .map(|a| a.text())
                    .unwrap_or_default();
                let key = stream_hash(sid, &from, &activate_target);

                let allowed = inner.domain_allowed(jid_to_domain(&from));
                if allowed && ProxyInner::activate(inner, &key).await {
                    info!(key = %key, by = %from, "activated bytestream");
                    server.send_packet(stanza.result_for()).await;
                } else {
                    warn!(key = %key, by = %from, "refusing bytestream activation");
                    let reply = stanza
                        .error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::NotAllowed);
                    server.send_packet(reply).await;
                }
                Ok(Handled::Consumed)
            }
            _ => Ok(Handled::Pass),
        }
    }
}

#[async_trait]
impl Extension for Proxy65Extension {
    fn name(&self) -> &'static str {
        "proxy65"
    }

    async fn start(&self, server: &Arc<Server>) -> Result<(), XmppError> {
        let inner = &self.inner;
        let service_jid = inner
            .config
            .jid
            .clone()
            .unwrap_or_else(|| format!("proxy.{}", server.domain()));
        let _ = inner.service_jid.set(service_jid);
        let advertised = inner
            .config
            .host
            .clone()
            .unwrap_or_else(|| server.domain().to_string());
        let _ = inner.advertised_host.set(advertised);
        let mut allowed = inner.config.allowed_domains.clone();
        if allowed.is_empty() {
            allowed.push(server.domain().to_string());
        }
        let _ = inner.allowed_domains.set(allowed);
        let _ = inner.server.set(Arc::downgrade(server));

        let listener = TcpListener::bind(("0.0.0.0", inner.config.port)).await?;
        info!(port = inner.config.port, "SOCKS5 proxy listening");

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((mut socket, peer_addr)) = accepted else {
                    continue;
                };
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    match socks5_negotiate(&mut socket).await {
                        Ok(key) => {
                            debug!(key = %key, peer = %peer_addr, "SOCKS5 connection");
                            inner.add_socket(&key, socket).await;
                        }
                        Err(e) => {
                            debug!(peer = %peer_addr, error = %e, "SOCKS5 negotiation failed");
                        }
                    }
                });
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.pairs.lock().await.clear();
    }

    fn discovery_items(&self) -> Vec<String> {
        vec![self.inner.service_jid().to_string()]
    }

    async fn handle_stanza(
        &self,
        server: &Server,
        stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        if stanza.to() != self.inner.service_jid() || stanza.kind() != StanzaKind::Iq {
            return Ok(Handled::Pass);
        }

        if stanza.type_attr() == "get" {
            if let Some(kind) = crate::disco::disco_query_kind(stanza) {
                let mut response = stanza.result_for();
                if kind == "info" {
                    let features = vec![
                        ns::DISCO_INFO.to_string(),
                        ns::DISCO_ITEMS.to_string(),
                        ns::BYTESTREAMS.to_string(),
                    ];
                    response.append(crate::disco::build_info(
                        "proxy",
                        "bytestreams",
                        "SOCKS5 Bytestreams",
                        &features,
                    ));
                } else {
                    response.append(crate::disco::build_items(&[]));
                }
                server.send_packet(response).await;
                return Ok(Handled::Consumed);
            }
        }

        if let Some(query) = stanza.child("query", ns::BYTESTREAMS).cloned() {
            return self.handle_bytestreams_iq(server, stanza, &query).await;
        }
        Ok(Handled::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_hash_is_stable_hex_sha1() {
        let key = stream_hash("sid1", "initiator@x.com/a", "target@x.com/b");
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        // order of the inputs matters
        assert_ne!(
            key,
            stream_hash("sid1", "target@x.com/b", "initiator@x.com/a")
        );
        assert_eq!(
            key,
            stream_hash("sid1", "initiator@x.com/a", "target@x.com/b")
        );
    }

    #[tokio::test]
    async fn pair_requires_both_sockets() {
        let inner = Arc::new(ProxyInner {
            config: Proxy65Config::default(),
            service_jid: OnceLock::new(),
            advertised_host: OnceLock::new(),
            allowed_domains: OnceLock::new(),
            server: OnceLock::new(),
            pairs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        // a lone target is not activatable
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();

        inner.add_socket("key1", client).await;
        assert!(!ProxyInner::activate(&inner, "key1").await);

        let client2 = TcpStream::connect(addr).await.unwrap();
        let (_server_side2, _) = listener.accept().await.unwrap();
        inner.add_socket("key1", client2).await;
        assert!(ProxyInner::activate(&inner, "key1").await);
        // a second activation of the same key is refused
        assert!(!ProxyInner::activate(&inner, "key1").await);
    }

    #[tokio::test]
    async fn socks5_handshake_extracts_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            socket.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0x00]);

            let host = b"deadbeef";
            let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
            request.extend_from_slice(host);
            request.extend_from_slice(&[0x00, 0x00]);
            socket.write_all(&request).await.unwrap();

            let mut response = vec![0u8; 5 + host.len() + 2];
            socket.read_exact(&mut response).await.unwrap();
            assert_eq!(response[1], 0x00);
        });

        let (mut socket, _) = listener.accept().await.unwrap();
        let host = socks5_negotiate(&mut socket).await.unwrap();
        assert_eq!(host, "deadbeef");
        client.await.unwrap();
    }
}

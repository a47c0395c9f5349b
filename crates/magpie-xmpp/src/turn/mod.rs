//! TURN relay (RFC 5766, UDP only, long-term credentials).
//!
//! One UDP socket serves STUN/TURN requests and channel data. Each
//! allocation owns a relay socket bound on demand; channel bindings map
//! channel numbers to peer addresses one-to-one in both directions.

pub mod stun;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::RngCore;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{PasswordError, PasswordProvider};
use crate::error::XmppError;
use crate::extension::{Extension, Handled};
use crate::server::Server;
use crate::stanza::Stanza;

use self::stun::{class, method, StunMessage};

/// Smallest valid channel number.
pub const CHANNEL_MIN: u16 = 0x4000;

/// Largest valid channel number.
pub const CHANNEL_MAX: u16 = 0x7FFE;

/// Nonce validity, seconds.
pub const NONCE_LIFETIME_SECS: u64 = 3600;

/// TURN relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    /// Bind host; defaults to all interfaces.
    #[serde(default)]
    pub host: Option<String>,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication realm; defaults to the server domain.
    #[serde(default)]
    pub realm: Option<String>,
    /// Lifetime granted when the client asks for less.
    #[serde(default = "default_lifetime")]
    pub default_lifetime: u32,
    /// Hard lifetime ceiling.
    #[serde(default = "maximum_lifetime")]
    pub maximum_lifetime: u32,
}

fn default_port() -> u16 {
    3478
}

fn default_lifetime() -> u32 {
    600
}

fn maximum_lifetime() -> u32 {
    3600
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            realm: None,
            default_lifetime: default_lifetime(),
            maximum_lifetime: maximum_lifetime(),
        }
    }
}

/// Generate a 48-byte nonce: 8 hex digits of expiry, 8 bytes of '0'
/// padding, 32 hex digits of MD5(first 16 bytes + ":" + secret).
pub fn generate_nonce(secret: &[u8], now_unix: u64) -> Vec<u8> {
    let expiry = now_unix + NONCE_LIFETIME_SECS;
    let mut nonce = format!("{expiry:08x}").into_bytes();
    nonce.resize(16, b'0');
    let mut hasher = Md5::new();
    hasher.update(&nonce[..16]);
    hasher.update(b":");
    hasher.update(secret);
    nonce.extend_from_slice(hex::encode(hasher.finalize()).as_bytes());
    nonce
}

/// Validate a nonce: size, padding, expiry and hash must all match. A
/// nonce whose expiry equals the current second is already rejected.
pub fn verify_nonce(nonce: &[u8], secret: &[u8], now_unix: u64) -> bool {
    if nonce.len() != 48 || nonce[8..16] != [b'0'; 8] {
        return false;
    }
    let Ok(expiry_hex) = std::str::from_utf8(&nonce[..8]) else {
        return false;
    };
    let Ok(expiry) = u64::from_str_radix(expiry_hex, 16) else {
        return false;
    };
    if expiry <= now_unix {
        return false;
    }
    let mut hasher = Md5::new();
    hasher.update(&nonce[..16]);
    hasher.update(b":");
    hasher.update(secret);
    nonce[16..] == *hex::encode(hasher.finalize()).as_bytes()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Allocation {
    client: SocketAddr,
    username: String,
    relay: Arc<UdpSocket>,
    relayed_addr: SocketAddr,
    channels: StdMutex<HashMap<u16, SocketAddr>>,
    expires: StdMutex<Instant>,
    transferred: AtomicI64,
    stop: CancellationToken,
}

impl Allocation {
    fn channel_for_peer(&self, peer: SocketAddr) -> Option<u16> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(_, addr)| **addr == peer)
            .map(|(channel, _)| *channel)
    }

    fn peer_for_channel(&self, channel: u16) -> Option<SocketAddr> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&channel)
            .copied()
    }

    fn refresh(&self, lifetime: u32) {
        *self.expires.lock().unwrap_or_else(|e| e.into_inner()) =
            Instant::now() + Duration::from_secs(lifetime as u64);
    }

    fn expired(&self) -> bool {
        *self.expires.lock().unwrap_or_else(|e| e.into_inner()) <= Instant::now()
    }
}

struct TurnInner {
    config: TurnConfig,
    realm: OnceLock<String>,
    secret: [u8; 16],
    socket: OnceLock<Arc<UdpSocket>>,
    server: OnceLock<Weak<Server>>,
    allocations: Mutex<HashMap<SocketAddr, Arc<Allocation>>>,
    shutdown: CancellationToken,
}

impl TurnInner {
    fn realm(&self) -> &str {
        self.realm.get().map(String::as_str).unwrap_or("")
    }

    fn clamp_lifetime(&self, requested: u32) -> u32 {
        self.config
            .default_lifetime
            .max(self.config.maximum_lifetime.min(requested))
    }

    async fn write_stun(&self, message: &StunMessage, to: SocketAddr, key: Option<&[u8]>) {
        if let Some(socket) = self.socket.get() {
            let encoded = message.encode(key);
            if let Err(e) = socket.send_to(&encoded, to).await {
                debug!(to = %to, error = %e, "failed to send STUN response");
            }
        }
    }

    async fn send_unauthorized(&self, request: &StunMessage, to: SocketAddr) {
        let mut response = request.response(class::ERROR);
        response.set_error(401, "Unauthorized");
        response.nonce = Some(generate_nonce(&self.secret, now_unix()));
        response.realm = Some(self.realm().to_string());
        self.write_stun(&response, to, None).await;
    }

    fn metrics(&self) -> Option<crate::metrics::Metrics> {
        self.server
            .get()
            .and_then(|weak| weak.upgrade())
            .map(|server| server.metrics().clone())
    }

    async fn teardown(&self, allocation: &Arc<Allocation>, reason: &str) {
        allocation.stop.cancel();
        let transferred = allocation.transferred.load(Ordering::Relaxed);
        info!(
            client = %allocation.client,
            username = %allocation.username,
            bytes = transferred,
            reason,
            "removed allocation"
        );
        if let Some(metrics) = self.metrics() {
            metrics.update_counter_by("turn.bytes", transferred);
            metrics.update_counter("turn.transfers");
        }
    }

    /// Handle a decoded, authenticated request.
    async fn dispatch(&self, message: StunMessage, from: SocketAddr, ha1: &[u8]) {
        let allocation = self.allocations.lock().await.get(&from).cloned();

        match message.method {
            method::ALLOCATE => {
                let mut response = message.response(class::SUCCESS);
                response.nonce = message.nonce.clone();
                response.realm = message.realm.clone();

                if allocation.is_some() {
                    response.set_error(437, "Allocation Mismatch");
                    self.write_stun(&response, from, Some(ha1)).await;
                    return;
                }
                if message.requested_transport != Some(0x11) {
                    response.set_error(442, "Unsupported Transport Protocol");
                    self.write_stun(&response, from, Some(ha1)).await;
                    return;
                }
                let bind_host = self.config.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
                let relay = match UdpSocket::bind((bind_host.as_str(), 0)).await {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        warn!(error = %e, "could not bind relay socket");
                        response.set_error(508, "Insufficient Capacity");
                        self.write_stun(&response, from, Some(ha1)).await;
                        return;
                    }
                };
                let relayed_addr = match relay.local_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!(error = %e, "relay socket has no local address");
                        response.set_error(508, "Insufficient Capacity");
                        self.write_stun(&response, from, Some(ha1)).await;
                        return;
                    }
                };

                let lifetime = self.clamp_lifetime(message.lifetime.unwrap_or(0));
                let allocation = Arc::new(Allocation {
                    client: from,
                    username: message.username.clone().unwrap_or_default(),
                    relay,
                    relayed_addr,
                    channels: StdMutex::new(HashMap::new()),
                    expires: StdMutex::new(
                        Instant::now() + Duration::from_secs(lifetime as u64),
                    ),
                    transferred: AtomicI64::new(0),
                    stop: CancellationToken::new(),
                });
                info!(
                    client = %from,
                    username = %allocation.username,
                    relayed = %relayed_addr,
                    lifetime,
                    "created allocation"
                );
                self.allocations.lock().await.insert(from, Arc::clone(&allocation));
                self.spawn_relay_loop(Arc::clone(&allocation));

                response.lifetime = Some(lifetime);
                response.xor_mapped = Some(from);
                response.xor_relayed = Some(relayed_addr);
                self.write_stun(&response, from, Some(ha1)).await;
            }
            method::CHANNEL_BIND => {
                let mut response = message.response(class::SUCCESS);
                let Some(allocation) = allocation else {
                    response.set_error(437, "Allocation Mismatch");
                    self.write_stun(&response, from, Some(ha1)).await;
                    return;
                };

                let channel = message.channel_number.unwrap_or(0);
                let peer = message.xor_peer;
                let valid = (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
                    && peer.is_some_and(|p| p.port() != 0);
                let conflict = peer.is_some_and(|peer| {
                    let bound_peer = allocation.peer_for_channel(channel);
                    let bound_channel = allocation.channel_for_peer(peer);
                    bound_peer.is_some_and(|p| p != peer)
                        || bound_channel.is_some_and(|c| c != channel)
                });
                if !valid || conflict {
                    response.set_error(400, "Bad Request");
                    self.write_stun(&response, from, Some(ha1)).await;
                    return;
                }
                let peer = peer.unwrap_or(from);
                debug!(channel, peer = %peer, client = %from, "bound channel");
                allocation
                    .channels
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(channel, peer);
                self.write_stun(&response, from, Some(ha1)).await;
            }
            method::REFRESH => {
                let mut response = message.response(class::SUCCESS);
                let Some(allocation) = allocation else {
                    response.set_error(437, "Allocation Mismatch");
                    self.write_stun(&response, from, Some(ha1)).await;
                    return;
                };

                let lifetime = match message.lifetime {
                    Some(0) | None => {
                        self.allocations.lock().await.remove(&from);
                        self.teardown(&allocation, "refresh").await;
                        0
                    }
                    Some(requested) => {
                        let lifetime = self.clamp_lifetime(requested);
                        allocation.refresh(lifetime);
                        debug!(client = %from, lifetime, "refreshed allocation");
                        lifetime
                    }
                };
                response.lifetime = Some(lifetime);
                self.write_stun(&response, from, Some(ha1)).await;
            }
            _ => {}
        }
    }

    /// Relay datagrams arriving from bound peers back to the client,
    /// wrapped as channel data.
    fn spawn_relay_loop(&self, allocation: Arc<Allocation>) {
        let socket = self.socket.get().cloned();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 65536];
            loop {
                let received = tokio::select! {
                    _ = allocation.stop.cancelled() => return,
                    received = allocation.relay.recv_from(&mut buffer) => received,
                };
                let Ok((size, peer)) = received else {
                    continue;
                };
                let Some(channel) = allocation.channel_for_peer(peer) else {
                    continue;
                };
                let frame = stun::build_channel_data(channel, &buffer[..size]);
                if let Some(socket) = &socket {
                    let _ = socket.send_to(&frame, allocation.client).await;
                }
                allocation
                    .transferred
                    .fetch_add(size as i64, Ordering::Relaxed);
            }
        });
    }

    /// Handle one datagram from the main socket.
    async fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        // channel data from the client towards a bound peer
        if stun::is_channel_data(data) {
            let Some((channel, payload)) = stun::parse_channel_data(data) else {
                return;
            };
            let allocation = self.allocations.lock().await.get(&from).cloned();
            if let Some(allocation) = allocation {
                if let Some(peer) = allocation.peer_for_channel(channel) {
                    let _ = allocation.relay.send_to(payload, peer).await;
                    allocation
                        .transferred
                        .fetch_add(payload.len() as i64, Ordering::Relaxed);
                }
            }
            return;
        }

        let message = match StunMessage::decode(data, None) {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %from, error = %e, "dropping invalid STUN packet");
                return;
            }
        };
        if message.class != class::REQUEST {
            return;
        }

        if message.method == method::BINDING {
            let mut response = message.response(class::SUCCESS);
            response.software = Some(crate::disco::SERVER_NAME.to_string());
            response.xor_mapped = Some(from);
            self.write_stun(&response, from, None).await;
            return;
        }
        if !matches!(
            message.method,
            method::ALLOCATE | method::CHANNEL_BIND | method::REFRESH
        ) {
            return;
        }

        // long-term credential check
        let realm_ok = message.realm.as_deref() == Some(self.realm());
        let username = message.username.clone().unwrap_or_default();
        let nonce_ok = message
            .nonce
            .as_deref()
            .map(|nonce| verify_nonce(nonce, &self.secret, now_unix()))
            .unwrap_or(false);
        if !realm_ok || username.is_empty() || !nonce_ok || !message.has_integrity {
            self.send_unauthorized(&message, from).await;
            return;
        }

        let Some(server) = self.server.get().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let ha1 = match server.passwords().digest(&username, self.realm()).await {
            Ok(ha1) => ha1,
            Err(PasswordError::Authorization) | Err(PasswordError::Temporary) => {
                // no hint about which part was wrong
                self.send_unauthorized(&message, from).await;
                return;
            }
        };

        // re-decode, this time verifying the message integrity
        let message = match StunMessage::decode(data, Some(&ha1)) {
            Ok(message) => message,
            Err(_) => {
                self.send_unauthorized(&message, from).await;
                return;
            }
        };
        self.dispatch(message, from, &ha1).await;
    }
}

/// The TURN relay extension.
pub struct TurnExtension {
    inner: Arc<TurnInner>,
}

impl TurnExtension {
    /// Create the extension.
    pub fn new(config: TurnConfig) -> Self {
        let mut secret = [0u8; 16];
        rand::rng().fill_bytes(&mut secret);
        Self {
            inner: Arc::new(TurnInner {
                config,
                realm: OnceLock::new(),
                secret,
                socket: OnceLock::new(),
                server: OnceLock::new(),
                allocations: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[async_trait]
impl Extension for TurnExtension {
    fn name(&self) -> &'static str {
        "turn"
    }

    async fn start(&self, server: &Arc<Server>) -> Result<(), XmppError> {
        let inner = &self.inner;
        let realm = inner
            .config
            .realm
            .clone()
            .unwrap_or_else(|| server.domain().to_string());
        let _ = inner.realm.set(realm);
        let _ = inner.server.set(Arc::downgrade(server));

        let host = inner.config.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let socket = Arc::new(UdpSocket::bind((host.as_str(), inner.config.port)).await?);
        info!(host = %host, port = inner.config.port, "TURN relay listening");
        let _ = inner.socket.set(Arc::clone(&socket));

        // receive loop
        {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let mut buffer = vec![0u8; 65536];
                loop {
                    let received = tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        received = socket.recv_from(&mut buffer) => received,
                    };
                    let Ok((size, from)) = received else {
                        continue;
                    };
                    let inner = Arc::clone(&inner);
                    let data = buffer[..size].to_vec();
                    tokio::spawn(async move {
                        inner.handle_packet(&data, from).await;
                    });
                }
            });
        }

        // expiry sweeper
        {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = tick.tick() => {}
                    }
                    let expired: Vec<Arc<Allocation>> = {
                        let mut allocations = inner.allocations.lock().await;
                        let clients: Vec<SocketAddr> = allocations
                            .iter()
                            .filter(|(_, allocation)| allocation.expired())
                            .map(|(client, _)| *client)
                            .collect();
                        clients
                            .into_iter()
                            .filter_map(|client| allocations.remove(&client))
                            .collect()
                    };
                    for allocation in expired {
                        inner.teardown(&allocation, "timeout").await;
                    }
                }
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        self.inner.shutdown.cancel();
        let mut allocations = self.inner.allocations.lock().await;
        for (_, allocation) in allocations.drain() {
            allocation.stop.cancel();
        }
    }

    async fn handle_stanza(
        &self,
        _server: &Server,
        _stanza: &mut Stanza,
    ) -> Result<Handled, XmppError> {
        // the relay speaks UDP, not stanzas
        Ok(Handled::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef";

    #[test]
    fn nonce_shape() {
        let nonce = generate_nonce(SECRET, 1_700_000_000);
        assert_eq!(nonce.len(), 48);
        assert_eq!(&nonce[8..16], b"00000000");
        assert!(nonce.iter().all(|b| b.is_ascii_hexdigit() || *b == b'0'));
    }

    #[test]
    fn nonce_verification() {
        let now = 1_700_000_000;
        let nonce = generate_nonce(SECRET, now);
        assert!(verify_nonce(&nonce, SECRET, now));
        assert!(verify_nonce(&nonce, SECRET, now + NONCE_LIFETIME_SECS - 1));

        // expiry boundary: a nonce at its expiry second is rejected
        assert!(!verify_nonce(&nonce, SECRET, now + NONCE_LIFETIME_SECS));
        assert!(!verify_nonce(&nonce, SECRET, now + NONCE_LIFETIME_SECS + 1));

        // wrong secret
        assert!(!verify_nonce(&nonce, b"other secret!!!!", now));

        // wrong padding
        let mut bad = nonce.clone();
        bad[9] = b'1';
        assert!(!verify_nonce(&bad, SECRET, now));

        // wrong size
        assert!(!verify_nonce(&nonce[..47], SECRET, now));
    }

    #[test]
    fn lifetime_clamping() {
        let inner = TurnInner {
            config: TurnConfig::default(),
            realm: OnceLock::new(),
            secret: [0; 16],
            socket: OnceLock::new(),
            server: OnceLock::new(),
            allocations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        assert_eq!(inner.clamp_lifetime(0), 600);
        assert_eq!(inner.clamp_lifetime(300), 600);
        assert_eq!(inner.clamp_lifetime(1200), 1200);
        assert_eq!(inner.clamp_lifetime(9999), 3600);
    }

    #[test]
    fn channel_bounds() {
        assert!(!(CHANNEL_MIN..=CHANNEL_MAX).contains(&0x3FFF));
        assert!((CHANNEL_MIN..=CHANNEL_MAX).contains(&0x4000));
        assert!((CHANNEL_MIN..=CHANNEL_MAX).contains(&0x7FFE));
        assert!(!(CHANNEL_MIN..=CHANNEL_MAX).contains(&0x7FFF));
    }
}

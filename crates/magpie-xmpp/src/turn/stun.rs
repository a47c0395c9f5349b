//! STUN message codec (RFC 5389/5766 subset).
//!
//! Covers the methods and attributes the relay needs: Binding, Allocate,
//! Refresh and ChannelBind with long-term credentials and HMAC-SHA1
//! message integrity. IPv4 only, matching the UDP-only relay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Magic cookie, fixed by RFC 5389.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN methods used by the relay.
pub mod method {
    /// Binding request.
    pub const BINDING: u16 = 0x001;
    /// TURN Allocate.
    pub const ALLOCATE: u16 = 0x003;
    /// TURN Refresh.
    pub const REFRESH: u16 = 0x004;
    /// TURN ChannelBind.
    pub const CHANNEL_BIND: u16 = 0x009;
}

/// STUN classes, already shifted into message-type position.
pub mod class {
    /// Request.
    pub const REQUEST: u16 = 0x0000;
    /// Success response.
    pub const SUCCESS: u16 = 0x0100;
    /// Error response.
    pub const ERROR: u16 = 0x0110;
}

mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

/// A decoded or to-be-encoded STUN message.
#[derive(Debug, Clone, Default)]
pub struct StunMessage {
    /// Method (Binding, Allocate, ...).
    pub method: u16,
    /// Class bits (request/success/error).
    pub class: u16,
    /// Transaction id.
    pub transaction_id: [u8; 12],
    /// USERNAME attribute.
    pub username: Option<String>,
    /// REALM attribute.
    pub realm: Option<String>,
    /// NONCE attribute.
    pub nonce: Option<Vec<u8>>,
    /// LIFETIME attribute, seconds.
    pub lifetime: Option<u32>,
    /// REQUESTED-TRANSPORT protocol number.
    pub requested_transport: Option<u8>,
    /// CHANNEL-NUMBER attribute.
    pub channel_number: Option<u16>,
    /// XOR-MAPPED-ADDRESS attribute.
    pub xor_mapped: Option<SocketAddr>,
    /// XOR-PEER-ADDRESS attribute.
    pub xor_peer: Option<SocketAddr>,
    /// XOR-RELAYED-ADDRESS attribute.
    pub xor_relayed: Option<SocketAddr>,
    /// ERROR-CODE attribute: numeric code and reason phrase.
    pub error: Option<(u16, String)>,
    /// SOFTWARE attribute.
    pub software: Option<String>,
    /// Whether a MESSAGE-INTEGRITY attribute was present on decode.
    pub has_integrity: bool,
}

impl StunMessage {
    /// A fresh request/response skeleton.
    pub fn new(method: u16, class: u16, transaction_id: [u8; 12]) -> Self {
        Self {
            method,
            class,
            transaction_id,
            ..Self::default()
        }
    }

    /// A response to this message with the given class.
    pub fn response(&self, class: u16) -> Self {
        Self::new(self.method, class, self.transaction_id)
    }

    /// Set the ERROR-CODE attribute and switch to the error class.
    pub fn set_error(&mut self, code: u16, reason: &str) {
        self.class = class::ERROR;
        self.error = Some((code, reason.to_string()));
    }

    /// Decode a datagram. When `integrity_key` is given, a present
    /// MESSAGE-INTEGRITY attribute is verified against it and a mismatch
    /// fails the decode.
    pub fn decode(data: &[u8], integrity_key: Option<&[u8]>) -> Result<Self, String> {
        if data.len() < 20 {
            return Err("short STUN header".to_string());
        }
        let message_type = u16::from_be_bytes([data[0], data[1]]);
        if message_type & 0xC000 != 0 {
            return Err("not a STUN message".to_string());
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return Err("bad magic cookie".to_string());
        }
        if data.len() != 20 + length {
            return Err("STUN length mismatch".to_string());
        }

        let mut message = StunMessage {
            method: (message_type & 0xF)
                | ((message_type >> 1) & 0x70)
                | ((message_type >> 2) & 0xF80),
            class: message_type & 0x0110,
            ..Self::default()
        };
        message.transaction_id.copy_from_slice(&data[8..20]);

        let mut offset = 20;
        while offset + 4 <= data.len() {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let value_start = offset + 4;
            let value_end = value_start + attr_len;
            if value_end > data.len() {
                return Err("attribute overruns message".to_string());
            }
            let value = &data[value_start..value_end];

            match attr_type {
                attr::USERNAME => {
                    message.username =
                        Some(String::from_utf8_lossy(value).into_owned());
                }
                attr::REALM => {
                    message.realm = Some(String::from_utf8_lossy(value).into_owned());
                }
                attr::NONCE => message.nonce = Some(value.to_vec()),
                attr::SOFTWARE => {
                    message.software = Some(String::from_utf8_lossy(value).into_owned());
                }
                attr::LIFETIME => {
                    if attr_len == 4 {
                        message.lifetime = Some(u32::from_be_bytes([
                            value[0], value[1], value[2], value[3],
                        ]));
                    }
                }
                attr::REQUESTED_TRANSPORT => {
                    if attr_len == 4 {
                        message.requested_transport = Some(value[0]);
                    }
                }
                attr::CHANNEL_NUMBER => {
                    if attr_len == 4 {
                        message.channel_number =
                            Some(u16::from_be_bytes([value[0], value[1]]));
                    }
                }
                attr::XOR_MAPPED_ADDRESS | attr::MAPPED_ADDRESS => {
                    message.xor_mapped = decode_xor_address(value);
                }
                attr::XOR_PEER_ADDRESS => {
                    message.xor_peer = decode_xor_address(value);
                }
                attr::XOR_RELAYED_ADDRESS => {
                    message.xor_relayed = decode_xor_address(value);
                }
                attr::ERROR_CODE => {
                    if attr_len >= 4 {
                        let code = (value[2] as u16) * 100 + value[3] as u16;
                        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                        message.error = Some((code, reason));
                    }
                }
                attr::MESSAGE_INTEGRITY => {
                    message.has_integrity = true;
                    if let Some(key) = integrity_key {
                        if attr_len != 20 {
                            return Err("bad MESSAGE-INTEGRITY length".to_string());
                        }
                        // the HMAC covers the message up to this attribute,
                        // with the length field counting through it
                        let mut covered = data[..offset].to_vec();
                        let adjusted = (offset - 20 + 24) as u16;
                        covered[2..4].copy_from_slice(&adjusted.to_be_bytes());
                        let expected = hmac_sha1(key, &covered);
                        if expected != value {
                            return Err("MESSAGE-INTEGRITY mismatch".to_string());
                        }
                    }
                }
                attr::FINGERPRINT => {}
                _ => {}
            }

            offset = value_end + ((4 - attr_len % 4) % 4);
        }

        Ok(message)
    }

    /// Encode to a datagram, appending MESSAGE-INTEGRITY when a key is
    /// given.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let message_type = (self.method & 0xF)
            | ((self.method & 0x70) << 1)
            | ((self.method & 0xF80) << 2)
            | self.class;

        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&message_type.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&self.transaction_id);

        if let Some(software) = &self.software {
            push_attr(&mut out, attr::SOFTWARE, software.as_bytes());
        }
        if let Some(username) = &self.username {
            push_attr(&mut out, attr::USERNAME, username.as_bytes());
        }
        if let Some(realm) = &self.realm {
            push_attr(&mut out, attr::REALM, realm.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            push_attr(&mut out, attr::NONCE, nonce);
        }
        if let Some(lifetime) = self.lifetime {
            push_attr(&mut out, attr::LIFETIME, &lifetime.to_be_bytes());
        }
        if let Some(protocol) = self.requested_transport {
            push_attr(&mut out, attr::REQUESTED_TRANSPORT, &[protocol, 0, 0, 0]);
        }
        if let Some(channel) = self.channel_number {
            let mut value = [0u8; 4];
            value[..2].copy_from_slice(&channel.to_be_bytes());
            push_attr(&mut out, attr::CHANNEL_NUMBER, &value);
        }
        if let Some(addr) = self.xor_mapped {
            if let Some(value) = encode_xor_address(addr) {
                push_attr(&mut out, attr::XOR_MAPPED_ADDRESS, &value);
            }
        }
        if let Some(addr) = self.xor_peer {
            if let Some(value) = encode_xor_address(addr) {
                push_attr(&mut out, attr::XOR_PEER_ADDRESS, &value);
            }
        }
        if let Some(addr) = self.xor_relayed {
            if let Some(value) = encode_xor_address(addr) {
                push_attr(&mut out, attr::XOR_RELAYED_ADDRESS, &value);
            }
        }
        if let Some((code, reason)) = &self.error {
            let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
            value.extend_from_slice(reason.as_bytes());
            push_attr(&mut out, attr::ERROR_CODE, &value);
        }

        if let Some(key) = integrity_key {
            // length counts through the MESSAGE-INTEGRITY attribute
            let adjusted = (out.len() - 20 + 24) as u16;
            out[2..4].copy_from_slice(&adjusted.to_be_bytes());
            let mac = hmac_sha1(key, &out);
            push_attr(&mut out, attr::MESSAGE_INTEGRITY, &mac);
        }

        let length = (out.len() - 20) as u16;
        out[2..4].copy_from_slice(&length.to_be_bytes());
        out
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("any key length works");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn push_attr(out: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    out.extend_from_slice(&attr_type.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    let padding = (4 - value.len() % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(padding));
}

fn decode_xor_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() != 8 || value[1] != 0x01 {
        // IPv4 only
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let ip = Ipv4Addr::new(
        value[4] ^ cookie[0],
        value[5] ^ cookie[1],
        value[6] ^ cookie[2],
        value[7] ^ cookie[3],
    );
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

fn encode_xor_address(addr: SocketAddr) -> Option<[u8; 8]> {
    let IpAddr::V4(ip) = addr.ip() else {
        return None;
    };
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let octets = ip.octets();
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut value = [0u8; 8];
    value[1] = 0x01;
    value[2..4].copy_from_slice(&port.to_be_bytes());
    for i in 0..4 {
        value[4 + i] = octets[i] ^ cookie[i];
    }
    Some(value)
}

/// Whether a datagram is TURN channel data (first two bits are 01).
pub fn is_channel_data(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] & 0xC0 == 0x40
}

/// Parse channel data into (channel number, payload).
pub fn parse_channel_data(data: &[u8]) -> Option<(u16, &[u8])> {
    if !is_channel_data(data) {
        return None;
    }
    let channel = u16::from_be_bytes([data[0], data[1]]);
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length > data.len() - 4 {
        return None;
    }
    Some((channel, &data[4..4 + length]))
}

/// Wrap a payload as channel data.
pub fn build_channel_data(channel: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&channel.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction_id() -> [u8; 12] {
        *b"0123456789ab"
    }

    #[test]
    fn binding_round_trip() {
        let mut message = StunMessage::new(method::BINDING, class::SUCCESS, transaction_id());
        message.xor_mapped = Some("192.0.2.1:3478".parse().unwrap());
        message.software = Some("magpie".to_string());

        let encoded = message.encode(None);
        let decoded = StunMessage::decode(&encoded, None).unwrap();
        assert_eq!(decoded.method, method::BINDING);
        assert_eq!(decoded.class, class::SUCCESS);
        assert_eq!(decoded.transaction_id, transaction_id());
        assert_eq!(decoded.xor_mapped, Some("192.0.2.1:3478".parse().unwrap()));
        assert_eq!(decoded.software.as_deref(), Some("magpie"));
    }

    #[test]
    fn allocate_attributes_round_trip() {
        let mut message = StunMessage::new(method::ALLOCATE, class::REQUEST, transaction_id());
        message.username = Some("alice".to_string());
        message.realm = Some("example.com".to_string());
        message.nonce = Some(vec![b'n'; 48]);
        message.lifetime = Some(600);
        message.requested_transport = Some(0x11);

        let decoded = StunMessage::decode(&message.encode(None), None).unwrap();
        assert_eq!(decoded.method, method::ALLOCATE);
        assert_eq!(decoded.username.as_deref(), Some("alice"));
        assert_eq!(decoded.realm.as_deref(), Some("example.com"));
        assert_eq!(decoded.nonce.as_deref(), Some(&[b'n'; 48][..]));
        assert_eq!(decoded.lifetime, Some(600));
        assert_eq!(decoded.requested_transport, Some(0x11));
    }

    #[test]
    fn message_integrity_verifies_and_rejects() {
        let key = b"secret-ha1-bytes";
        let mut message =
            StunMessage::new(method::REFRESH, class::REQUEST, transaction_id());
        message.username = Some("alice".to_string());
        message.lifetime = Some(0);

        let encoded = message.encode(Some(key));
        let decoded = StunMessage::decode(&encoded, Some(key)).unwrap();
        assert!(decoded.has_integrity);
        assert_eq!(decoded.lifetime, Some(0));

        assert!(StunMessage::decode(&encoded, Some(b"wrong-key")).is_err());

        // tampering breaks the MAC
        let mut tampered = encoded.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;
        assert!(StunMessage::decode(&tampered, Some(key)).is_err());
    }

    #[test]
    fn error_code_round_trip() {
        let mut message = StunMessage::new(method::ALLOCATE, class::REQUEST, transaction_id());
        message.set_error(437, "Allocation Mismatch");
        let decoded = StunMessage::decode(&message.encode(None), None).unwrap();
        assert_eq!(decoded.class, class::ERROR);
        assert_eq!(decoded.error, Some((437, "Allocation Mismatch".to_string())));
    }

    #[test]
    fn channel_data_frame() {
        assert!(!is_channel_data(&[0x00, 0x01, 0, 0]));
        assert!(!is_channel_data(&[0x80, 0x01, 0, 0]));

        let frame = build_channel_data(0x4001, b"payload");
        assert!(is_channel_data(&frame));
        let (channel, payload) = parse_channel_data(&frame).unwrap();
        assert_eq!(channel, 0x4001);
        assert_eq!(payload, b"payload");

        // declared length beyond the datagram is rejected
        let bad = [0x40, 0x01, 0x00, 0xFF, 0x00];
        assert_eq!(parse_channel_data(&bad), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(StunMessage::decode(&[0u8; 10], None).is_err());
        let mut bad_cookie = StunMessage::new(method::BINDING, class::REQUEST, transaction_id())
            .encode(None);
        bad_cookie[4] = 0;
        assert!(StunMessage::decode(&bad_cookie, None).is_err());
    }
}

//! Stanza model.
//!
//! A [`Stanza`] wraps a parsed XML element with tag `iq`, `presence` or
//! `message`. The element tree is kept as-is so extensions can inspect the
//! payloads they understand and round-trip the ones they do not.

use minidom::Element;

use crate::error::{StanzaErrorCondition, StanzaErrorType, XmppError};

/// XML namespaces used across the server.
pub mod ns {
    /// RFC 6120 client streams.
    pub const CLIENT: &str = "jabber:client";
    /// RFC 6120 stanza error conditions.
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// XEP-0030 service discovery, info queries.
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// XEP-0030 service discovery, items queries.
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// RFC 6121 roster management.
    pub const ROSTER: &str = "jabber:iq:roster";
    /// XEP-0045 multi-user chat.
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// XEP-0045 occupant presence payloads.
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    /// XEP-0045 admin queries.
    pub const MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
    /// XEP-0045 owner queries.
    pub const MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
    /// XEP-0004 data forms.
    pub const DATA_FORMS: &str = "jabber:x:data";
    /// XEP-0049 private XML storage.
    pub const PRIVATE: &str = "jabber:iq:private";
    /// XEP-0054 vcard-temp.
    pub const VCARD: &str = "vcard-temp";
    /// XEP-0059 result set management.
    pub const RSM: &str = "http://jabber.org/protocol/rsm";
    /// XEP-0065 SOCKS5 bytestreams.
    pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
    /// XEP-0085 chat state notifications.
    pub const CHAT_STATES: &str = "http://jabber.org/protocol/chatstates";
    /// XEP-0092 software version.
    pub const VERSION: &str = "jabber:iq:version";
    /// XEP-0136 message archiving.
    pub const ARCHIVE: &str = "urn:xmpp:archive";
    /// XEP-0199 ping.
    pub const PING: &str = "urn:xmpp:ping";
    /// XEP-0202 entity time.
    pub const TIME: &str = "urn:xmpp:time";
    /// XEP-0203 delayed delivery.
    pub const DELAY: &str = "urn:xmpp:delay";
    /// Share coordination service.
    pub const SHARES: &str = "http://magpie.im/protocol/shares";
    /// Diagnostics probes.
    pub const DIAGNOSTICS: &str = "http://magpie.im/protocol/diagnostics";
}

/// Top-level stanza tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    /// Info/query request-response
    Iq,
    /// One-directional message
    Message,
    /// Network availability broadcast
    Presence,
}

impl StanzaKind {
    /// Parse a tag name.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "iq" => Some(StanzaKind::Iq),
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            _ => None,
        }
    }
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaKind::Iq => write!(f, "iq"),
            StanzaKind::Message => write!(f, "message"),
            StanzaKind::Presence => write!(f, "presence"),
        }
    }
}

/// A top-level XMPP stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    elem: Element,
}

impl Stanza {
    /// Wrap a parsed element. Fails on unknown top-level tags.
    pub fn from_element(elem: Element) -> Result<Self, XmppError> {
        let kind = StanzaKind::from_tag(elem.name())
            .ok_or_else(|| XmppError::malformed(format!("unknown stanza tag '{}'", elem.name())))?;
        Ok(Self { kind, elem })
    }

    /// Parse a stanza from its XML serialization.
    pub fn parse(xml: &str) -> Result<Self, XmppError> {
        let elem: Element = xml
            .parse()
            .map_err(|e| XmppError::malformed(format!("invalid XML: {e}")))?;
        Self::from_element(elem)
    }

    /// Build an empty stanza of the given kind.
    pub fn new(kind: StanzaKind) -> Self {
        let elem = Element::builder(kind.to_string(), ns::CLIENT).build();
        Self { kind, elem }
    }

    /// Build an IQ with the given type and id.
    pub fn iq(iq_type: &str, id: &str) -> Self {
        let mut stanza = Self::new(StanzaKind::Iq);
        stanza.set_type(iq_type);
        stanza.set_id(id);
        stanza
    }

    /// Build an available presence (no type attribute).
    pub fn presence() -> Self {
        Self::new(StanzaKind::Presence)
    }

    /// Build a presence with the given type attribute.
    pub fn presence_type(presence_type: &str) -> Self {
        let mut stanza = Self::new(StanzaKind::Presence);
        stanza.set_type(presence_type);
        stanza
    }

    /// Build a message with the given type attribute.
    pub fn message(message_type: &str) -> Self {
        let mut stanza = Self::new(StanzaKind::Message);
        stanza.set_type(message_type);
        stanza
    }

    /// Stanza kind.
    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    /// Underlying element.
    pub fn element(&self) -> &Element {
        &self.elem
    }

    /// Consume into the underlying element.
    pub fn into_element(self) -> Element {
        self.elem
    }

    /// Sender JID attribute, or "".
    pub fn from(&self) -> &str {
        self.elem.attr("from").unwrap_or("")
    }

    /// Recipient JID attribute, or "".
    pub fn to(&self) -> &str {
        self.elem.attr("to").unwrap_or("")
    }

    /// Stanza id attribute, or "".
    pub fn id(&self) -> &str {
        self.elem.attr("id").unwrap_or("")
    }

    /// Stanza type attribute, or "".
    pub fn type_attr(&self) -> &str {
        self.elem.attr("type").unwrap_or("")
    }

    /// Set the sender JID.
    pub fn set_from(&mut self, from: &str) {
        self.elem.set_attr("from", from);
    }

    /// Set the recipient JID.
    pub fn set_to(&mut self, to: &str) {
        self.elem.set_attr("to", to);
    }

    /// Set the stanza id.
    pub fn set_id(&mut self, id: &str) {
        self.elem.set_attr("id", id);
    }

    /// Set the type attribute.
    pub fn set_type(&mut self, stanza_type: &str) {
        self.elem.set_attr("type", stanza_type);
    }

    /// First child with the given name and namespace.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.elem.get_child(name, namespace)
    }

    /// First child with the given name, regardless of namespace.
    pub fn child_named(&self, name: &str) -> Option<&Element> {
        self.elem.children().find(|c| c.name() == name)
    }

    /// All child payloads.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.elem.children()
    }

    /// Append a payload element.
    pub fn append(&mut self, child: Element) {
        self.elem.append_child(child);
    }

    /// Remove every child with the given name and namespace.
    pub fn remove_children(&mut self, name: &str, namespace: &str) {
        while self.elem.remove_child(name, namespace).is_some() {}
    }

    /// Message body text, if any.
    pub fn body(&self) -> Option<String> {
        self.child_named("body").map(|b| b.text())
    }

    /// Replace the message body.
    pub fn set_body(&mut self, body: &str) {
        while self.elem.remove_child("body", ns::CLIENT).is_some() {}
        self.elem
            .append_child(Element::builder("body", ns::CLIENT).append(body).build());
    }

    /// Presence priority from the `<priority/>` child, defaulting to 0.
    pub fn priority(&self) -> i8 {
        self.child_named("priority")
            .and_then(|p| p.text().trim().parse().ok())
            .unwrap_or(0)
    }

    /// Add an XEP-0203 delay stamp, replacing any previous stamp.
    pub fn stamp_delay(&mut self, from: &str, stamp: chrono::DateTime<chrono::Utc>) {
        while self.elem.remove_child("delay", ns::DELAY).is_some() {}
        self.elem.append_child(
            Element::builder("delay", ns::DELAY)
                .attr("from", from)
                .attr("stamp", stamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .build(),
        );
    }

    /// Build a result reply to this IQ: addressing swapped, same id.
    pub fn result_for(&self) -> Stanza {
        let mut reply = Stanza::iq("result", self.id());
        reply.set_from(self.to());
        reply.set_to(self.from());
        reply
    }

    /// Build an error reply: addressing swapped, same id, original payloads
    /// echoed, error element appended.
    pub fn error_reply(
        &self,
        error_type: StanzaErrorType,
        condition: StanzaErrorCondition,
    ) -> Stanza {
        let mut reply = Stanza::new(self.kind);
        reply.set_from(self.to());
        reply.set_to(self.from());
        if !self.id().is_empty() {
            reply.set_id(self.id());
        }
        reply.set_type("error");
        for child in self.elem.children() {
            reply.append(child.clone());
        }
        reply.append(build_error_element(error_type, condition));
        reply
    }

    /// Serialize to XML.
    pub fn serialize(&self) -> String {
        String::from(&self.elem)
    }
}

/// Build a stanza `<error/>` element with a defined condition.
pub fn build_error_element(
    error_type: StanzaErrorType,
    condition: StanzaErrorCondition,
) -> Element {
    Element::builder("error", ns::CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_accessors() {
        let stanza = Stanza::parse(
            "<message xmlns='jabber:client' from='a@x.com/r' to='b@x.com' \
             type='chat' id='m1'><body>hi</body></message>",
        )
        .unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Message);
        assert_eq!(stanza.from(), "a@x.com/r");
        assert_eq!(stanza.to(), "b@x.com");
        assert_eq!(stanza.type_attr(), "chat");
        assert_eq!(stanza.id(), "m1");
        assert_eq!(stanza.body().as_deref(), Some("hi"));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(Stanza::parse("<stream xmlns='jabber:client'/>").is_err());
    }

    #[test]
    fn serialize_round_trip() {
        let mut stanza = Stanza::presence();
        stanza.set_from("a@x.com/r");
        stanza.set_to("x.com");
        let parsed = Stanza::parse(&stanza.serialize()).unwrap();
        assert_eq!(parsed.from(), "a@x.com/r");
        assert_eq!(parsed.to(), "x.com");
        assert_eq!(parsed.type_attr(), "");
    }

    #[test]
    fn error_reply_swaps_addressing() {
        let mut iq = Stanza::iq("get", "q1");
        iq.set_from("a@x.com/r");
        iq.set_to("x.com");
        let reply = iq.error_reply(StanzaErrorType::Cancel, StanzaErrorCondition::ItemNotFound);
        assert_eq!(reply.from(), "x.com");
        assert_eq!(reply.to(), "a@x.com/r");
        assert_eq!(reply.id(), "q1");
        assert_eq!(reply.type_attr(), "error");
        let error = reply.child_named("error").unwrap();
        assert!(error.get_child("item-not-found", ns::STANZAS).is_some());
    }

    #[test]
    fn set_body_replaces_existing() {
        let mut msg = Stanza::parse(
            "<message xmlns='jabber:client'><body>old</body><x xmlns='jabber:x:data'/></message>",
        )
        .unwrap();
        msg.set_body("new");
        assert_eq!(msg.body().as_deref(), Some("new"));
        assert!(msg.child("x", ns::DATA_FORMS).is_some());
    }

    #[test]
    fn priority_parsing() {
        let pres = Stanza::parse(
            "<presence xmlns='jabber:client'><priority>5</priority></presence>",
        )
        .unwrap();
        assert_eq!(pres.priority(), 5);
        assert_eq!(Stanza::presence().priority(), 0);
    }
}

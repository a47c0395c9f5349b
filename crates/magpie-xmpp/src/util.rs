//! JID string helpers.
//!
//! Stanza attributes carry JIDs as raw strings; these helpers split them
//! without allocating more than the caller asked for. Comparison throughout
//! the server is case-sensitive and no Unicode normalization is applied.
//! Typed parsing (the `jid` crate) is used at the session and config
//! boundaries where validity actually matters.

/// Returns the bare JID (strips the resource, if any).
pub fn jid_to_bare(jid: &str) -> &str {
    match jid.find('/') {
        Some(idx) => &jid[..idx],
        None => jid,
    }
}

/// Returns the node part ("user" in user@domain/resource), or "" if absent.
pub fn jid_to_user(jid: &str) -> &str {
    match jid.find('@') {
        Some(idx) => &jid[..idx],
        None => "",
    }
}

/// Returns the domain part of a JID, or "" for a malformed JID.
pub fn jid_to_domain(jid: &str) -> &str {
    let bare = jid_to_bare(jid);
    match bare.find('@') {
        Some(idx) => &bare[idx + 1..],
        None => bare,
    }
}

/// Returns the resource part, or "" if the JID is bare.
pub fn jid_to_resource(jid: &str) -> &str {
    match jid.find('/') {
        Some(idx) => &jid[idx + 1..],
        None => "",
    }
}

/// Checks that a JID is a bare user JID: exactly `node@domain` with a
/// non-empty node and domain and no resource.
pub fn is_bare_jid(jid: &str) -> bool {
    let mut parts = jid.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(user), Some(domain), None) => {
            !user.is_empty()
                && !domain.is_empty()
                && !domain.contains('/')
                && !user.contains('/')
        }
        _ => false,
    }
}

/// Checks that a JID carries a resource part.
pub fn is_full_jid(jid: &str) -> bool {
    !jid_to_resource(jid).is_empty() && !jid_to_user(jid).is_empty()
}

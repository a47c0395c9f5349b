//! Common types for the XMPP server.

use serde::{Deserialize, Serialize};

/// MUC room affiliation levels.
///
/// The derived ordering is the privilege ordering used for permission
/// checks: Outcast < None < Member < Admin < Owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Affiliation {
    /// Banned from the room
    Outcast,
    /// No affiliation
    None,
    /// Room member
    Member,
    /// Room administrator
    Admin,
    /// Room owner
    Owner,
}

impl Affiliation {
    /// XML attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Outcast => "outcast",
            Affiliation::None => "none",
            Affiliation::Member => "member",
            Affiliation::Admin => "admin",
            Affiliation::Owner => "owner",
        }
    }

    /// Parse an XML attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "outcast" => Some(Affiliation::Outcast),
            "none" => Some(Affiliation::None),
            "member" => Some(Affiliation::Member),
            "admin" => Some(Affiliation::Admin),
            "owner" => Some(Affiliation::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// MUC room role (session-lived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// No role (not in room)
    None,
    /// Visitor (can read, limited send)
    Visitor,
    /// Participant (normal user)
    Participant,
    /// Moderator (can kick, manage)
    Moderator,
}

impl Role {
    /// XML attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Visitor => "visitor",
            Role::Participant => "participant",
            Role::Moderator => "moderator",
        }
    }

    /// Parse an XML attribute value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Role::None),
            "visitor" => Some(Role::Visitor),
            "participant" => Some(Role::Participant),
            "moderator" => Some(Role::Moderator),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

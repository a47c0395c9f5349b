//! Error types for the XMPP server.

use thiserror::Error;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed stanza or missing required attributes
    #[error("Malformed stanza: {0}")]
    Malformed(String),

    /// Authentication or credential failure
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invariant violation; the offending stanza is aborted without a reply
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl XmppError {
    /// Create a new malformed-stanza error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Stanza error types per RFC 6120 §8.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry; the error cannot be remedied
    Cancel,
    /// Proceed, the condition was only a warning
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting
    Wait,
}

impl StanzaErrorType {
    /// XML attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorType::Auth => "auth",
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Continue => "continue",
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Wait => "wait",
        }
    }
}

/// Defined stanza error conditions used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    NotAcceptable,
    NotAllowed,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::Conflict => "conflict",
            StanzaErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorCondition::Forbidden => "forbidden",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::NotAcceptable => "not-acceptable",
            StanzaErrorCondition::NotAllowed => "not-allowed",
            StanzaErrorCondition::RecipientUnavailable => "recipient-unavailable",
            StanzaErrorCondition::Redirect => "redirect",
            StanzaErrorCondition::RegistrationRequired => "registration-required",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_names_match_wire() {
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
        assert_eq!(
            StanzaErrorCondition::RegistrationRequired.as_str(),
            "registration-required"
        );
        assert_eq!(StanzaErrorType::Modify.as_str(), "modify");
    }
}

//! # magpie-xmpp
//!
//! XMPP server core with a peer-to-peer file-share coordination role.
//!
//! The server terminates client sessions, routes stanzas between local and
//! remote entities, and hosts an ordered pipeline of extension services:
//! presence/roster, multi-user chat, vCards, private storage, message
//! archiving with offline delivery, service discovery, a SOCKS5 bytestream
//! relay, a STUN/TURN relay, and a share coordinator that directs peers to
//! each other instead of storing files.
//!
//! ## Architecture
//!
//! - **Server**: pipeline dispatch and routing; sessions enter through the
//!   session registry, the low-level stream transport stays outside.
//! - **Extensions**: each sees every stanza in priority order and may
//!   consume, transform, or pass it.
//! - **Contracts**: persistence ([`storage::Storage`]), credentials
//!   ([`auth::PasswordProvider`]) and metrics emission
//!   ([`metrics::MetricsSink`]) are traits the host wires up.
//!
//! ## Protocol support
//!
//! RFC 6120/6121 stanza semantics, XEP-0030, 0045, 0049, 0054, 0059, 0065,
//! 0092, 0136, 0199, 0202, plus STUN/TURN per RFC 5389/5766 (UDP,
//! long-term credentials only).

pub mod archive;
pub mod auth;
pub mod disco;
pub mod error;
pub mod extension;
pub mod metrics;
pub mod muc;
pub mod presence;
pub mod privacy;
pub mod proxy65;
pub mod registry;
pub mod roster;
pub mod routing;
pub mod server;
pub mod share;
pub mod stanza;
pub mod storage;
pub mod turn;
pub mod types;
pub mod util;
pub mod xep;

pub use error::{StanzaErrorCondition, StanzaErrorType, XmppError};
pub use extension::{Extension, Handled};
pub use metrics::{Metrics, MetricsSink};
pub use server::{Server, ServerBuilder};
pub use stanza::{ns, Stanza, StanzaKind};
pub use storage::{MemoryStorage, Storage};
pub use types::{Affiliation, Role};

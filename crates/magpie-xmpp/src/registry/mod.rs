//! Session registry.
//!
//! Tracks bound client sessions by full JID for stanza routing. The
//! low-level acceptor owns the socket; the registry only sees the session's
//! outbound channel. The outbox is non-blocking: a full channel is treated
//! as a dead session and closed by the caller.

mod session_registry;

pub use session_registry::{SendResult, SessionInfo, SessionRegistry, OUTBOX_CAPACITY};

//! Minor XEP responders.

pub mod diag;
pub mod xep0049;
pub mod xep0054;
pub mod xep0092;
pub mod xep0199;
pub mod xep0202;

pub use diag::{DiagExtension, ProbeRecord};
pub use xep0049::PrivateStorageExtension;
pub use xep0054::VcardExtension;
pub use xep0092::VersionExtension;
pub use xep0199::PingExtension;
pub use xep0202::TimeExtension;

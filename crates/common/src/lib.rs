//! Shared types for acmevault crates.
//!
//! - [`ids`]: typed UUID wrappers for vault entities
//! - [`poll`]: bounded retry/poll policies used by every workflow wait

pub mod ids;
pub mod poll;

pub use ids::{CertificateId, IdentifierId, RegistrationId};
pub use poll::PollPolicy;

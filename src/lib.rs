//! icelink library
//!
//! Bootstraps a direct peer-to-peer transport session between two endpoints
//! through an out-of-band HTTP signaling exchange. Candidate gathering and
//! connectivity checks are delegated to an ICE connectivity agent; this crate
//! owns the session-description codec, the signaling transport, and the
//! role coordinator that sequences the two.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod signaling;
pub mod traffic;

#[cfg(test)]
pub(crate) mod test_support;

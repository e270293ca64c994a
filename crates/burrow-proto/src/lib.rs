//! Agent protocol definitions
//!
//! Newt (site), Olm (client) and remote exit node agents talk to the
//! coordinator over a persistent channel using JSON envelopes of the form
//! `{"type": "...", "data": {...}}`. This crate defines that envelope, the
//! message type names and the payloads the control plane reads and writes.

pub mod messages;

pub use messages::*;

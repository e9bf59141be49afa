//! Nostr relay integration module
//!
//! This module provides the transport session and wire types for pulling
//! stored events from a relay over its REQ/EVENT/EOSE subscription protocol.
//! The session delivers frames sequentially and leaves event interpretation
//! to the audit layer.

/// WebSocket session and transport trait
mod session;
/// Wire type definitions for relay frames and filters
mod types;

pub use session::{RelaySession, RelayTransport};
pub use types::*;

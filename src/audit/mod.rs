//! Relay Audit Module
//!
//! This module provides all the core logic and services for auditing a ledger's
//! event stream on a Nostr relay. It is composed of several submodules, each
//! responsible for one aspect of the audit:
//!
//! - `engine`: The main entry point and coordinator. It drives the paginated
//!   pull loop and wires together extraction, aggregation, and persistence.
//! - `extractor`: Pluggable record extraction strategies (balance snapshots and
//!   ledger transactions) and their subscription filters.
//! - `ledger`: The deduplicating aggregator keyed by business identity with
//!   last-write-wins conflict resolution and running aggregates.
//! - `progress`: Per-run counters, progress logging, and run summaries.
//! - `events`: Event types and handler traits for observing a run in flight.
//! - `store`: Persistence boundary for seeding and saving the ledger.
//! - `types`: Domain record variants and the audit error taxonomy.
//!
//! The engine owns the ledger for the duration of one run; callers observe it
//! through the snapshot accessors or by registering event handlers.

/// Main coordinator for the audit run
pub mod engine;
/// Event system for observing runs in flight
pub mod events;
/// Pluggable record extraction strategies
pub mod extractor;
/// Deduplicating ledger aggregation
pub mod ledger;
/// Tracks audit progress and statistics
pub mod progress;
/// Ledger persistence boundary
pub mod store;
/// Domain records and error types
pub mod types;

pub use engine::*;

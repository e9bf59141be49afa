//!
//! Utility module for the auditor.
//!
//! Re-exports formatting helpers for use throughout the codebase.
/// Utility functions for formatting and display
pub mod index;

pub use index::{format_btc, format_sats};

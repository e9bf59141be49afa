//! Progress tracking for audit runs.
//!
//! This module provides the `AuditProgress` counters used by the engine to
//! distinguish "no events matched" from "nothing arrived at all", to report
//! live progress, and to summarize a finished or aborted run. All counters
//! are per run; the ledger itself lives in the aggregator.

use tracing::info;

/// Counters for one audit run.
#[derive(Debug, Clone, Default)]
pub struct AuditProgress {
    /// Raw events observed this run, matching or not.
    events_observed: u64,
    /// Events that produced a domain record.
    events_accepted: u64,
    /// Events rejected by the extractor.
    events_rejected: u64,
    /// Structurally invalid inbound frames.
    malformed_frames: u64,
    /// Events observed per completed round.
    events_per_round: Vec<u64>,
    /// Observed count at the last progress log.
    last_logged: u64,
}

impl AuditProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_observed(&mut self) {
        self.events_observed += 1;
    }

    pub fn record_accepted(&mut self) {
        self.events_accepted += 1;
    }

    pub fn record_rejected(&mut self) {
        self.events_rejected += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed_frames += 1;
    }

    /// Record a finished round and the number of events it delivered.
    pub fn finish_round(&mut self, events_in_round: u64) {
        self.events_per_round.push(events_in_round);
    }

    pub fn rounds_completed(&self) -> u64 {
        self.events_per_round.len() as u64
    }

    pub fn events_observed(&self) -> u64 {
        self.events_observed
    }

    pub fn events_accepted(&self) -> u64 {
        self.events_accepted
    }

    pub fn events_rejected(&self) -> u64 {
        self.events_rejected
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    pub fn events_per_round(&self) -> &[u64] {
        &self.events_per_round
    }

    /// Log progress every 500 observed events or when forced.
    pub fn log_progress(&mut self, force: bool) {
        let since_last = self.events_observed.saturating_sub(self.last_logged);
        if (force || since_last >= 500) && self.events_observed > 0 {
            info!(
                "Audit progress: {} events observed ({} accepted, {} rejected) over {} completed rounds",
                self.events_observed,
                self.events_accepted,
                self.events_rejected,
                self.rounds_completed()
            );
            self.last_logged = self.events_observed;
        }
    }

    /// Get a human-readable summary of the run counters
    pub fn summary(&self) -> String {
        format!(
            "{} rounds, {} events observed, {} accepted, {} rejected{}",
            self.rounds_completed(),
            self.events_observed,
            self.events_accepted,
            self.events_rejected,
            if self.malformed_frames == 0 {
                String::new()
            } else {
                format!(", {} malformed frames", self.malformed_frames)
            }
        )
    }
}

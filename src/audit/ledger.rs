//! Deduplicating ledger aggregation.
//!
//! This module owns the in-memory ledger: one authoritative record per
//! business key, merged under last-write-wins by event timestamp. The running
//! total is maintained incrementally on every merge and must always equal a
//! fold over the ledger - `stats()` is a pure read that cannot drift from the
//! records it summarizes.

use crate::audit::types::{AuditError, DomainRecord};

use std::collections::BTreeMap;

/// Result of merging one record into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No record existed for the business key.
    Inserted,
    /// An older record was replaced.
    Updated,
    /// The existing record has an equal or later timestamp. Ties keep the
    /// existing entry so replays are deterministic.
    Ignored,
}

/// Aggregate view over the current ledger contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateStats {
    /// Sum of all record values in sats.
    pub total_sats: u64,
    /// Number of distinct business keys.
    pub record_count: usize,
}

/// Owns the ledger and keeps its aggregates current through every merge.
#[derive(Debug, Default)]
pub struct LedgerAggregator {
    records: BTreeMap<String, DomainRecord>,
    total_sats: u64,
}

impl LedgerAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one record under last-write-wins.
    ///
    /// Inserts when the key is absent, replaces when the incoming timestamp is
    /// strictly later, ignores otherwise. Merging is idempotent: feeding the
    /// same record twice leaves the ledger and stats unchanged.
    pub fn merge(&mut self, record: DomainRecord) -> Result<MergeOutcome, AuditError> {
        let key = record.business_key().to_string();
        match self.records.get(&key) {
            None => {
                self.total_sats += record.sats();
                self.records.insert(key, record);
                Ok(MergeOutcome::Inserted)
            }
            Some(existing) => {
                if !existing.same_variant(&record) {
                    return Err(AuditError::RecordVariantMismatch { key });
                }
                if record.timestamp() > existing.timestamp() {
                    self.total_sats = self.total_sats - existing.sats() + record.sats();
                    self.records.insert(key, record);
                    Ok(MergeOutcome::Updated)
                } else {
                    Ok(MergeOutcome::Ignored)
                }
            }
        }
    }

    /// The keyed ledger view.
    pub fn records(&self) -> &BTreeMap<String, DomainRecord> {
        &self.records
    }

    /// Ledger contents as an ordered record array, the persisted shape.
    pub fn to_records(&self) -> Vec<DomainRecord> {
        self.records.values().cloned().collect()
    }

    /// Aggregates consistent with the latest merge.
    pub fn stats(&self) -> AggregateStats {
        AggregateStats {
            total_sats: self.total_sats,
            record_count: self.records.len(),
        }
    }
}

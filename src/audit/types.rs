use crate::relay::RelayError;

use serde::{Deserialize, Serialize};

/// Direction of a ledger transaction, taken from the leading segment of the
/// event's `t` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionCategory {
	Internal,
	Inbound,
	Outbound,
}

impl TransactionCategory {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"internal" => Some(Self::Internal),
			"inbound" => Some(Self::Inbound),
			"outbound" => Some(Self::Outbound),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Internal => "internal",
			Self::Inbound => "inbound",
			Self::Outbound => "outbound",
		}
	}
}

/// Latest balance snapshot for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
	/// Account pubkey taken from the `d` tag.
	pub account: String,
	/// Balance in sats.
	pub sats: u64,
	/// `created_at` of the event this snapshot came from.
	pub updated_at: i64,
}

/// One ledger transaction, keyed by the event id the wrapping events
/// reference. A `start` event and its `ok`/`error` outcome resolve to the
/// same record; the later one wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
	/// Referenced event id from the `e` tag, not the wrapping event's own id.
	pub reference_id: String,
	/// Counterparty pubkey from the `p` tag.
	pub counterparty: String,
	/// Amount in sats.
	pub sats: u64,
	pub category: TransactionCategory,
	/// True when the outcome segment of the `t` tag is `error`.
	pub failed: bool,
	/// `created_at` of the event this record came from.
	pub updated_at: i64,
}

/// A typed record extracted from a raw relay event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomainRecord {
	Balance(BalanceRecord),
	Transaction(TransactionRecord),
}

impl DomainRecord {
	/// The business identity used for deduplication. Distinct from the raw
	/// event's own id.
	pub fn business_key(&self) -> &str {
		match self {
			DomainRecord::Balance(b) => &b.account,
			DomainRecord::Transaction(t) => &t.reference_id,
		}
	}

	/// Value in sats.
	pub fn sats(&self) -> u64 {
		match self {
			DomainRecord::Balance(b) => b.sats,
			DomainRecord::Transaction(t) => t.sats,
		}
	}

	/// Source event timestamp used for last-write-wins conflict resolution.
	pub fn timestamp(&self) -> i64 {
		match self {
			DomainRecord::Balance(b) => b.updated_at,
			DomainRecord::Transaction(t) => t.updated_at,
		}
	}

	fn variant(&self) -> &'static str {
		match self {
			DomainRecord::Balance(_) => "balance",
			DomainRecord::Transaction(_) => "transaction",
		}
	}

	/// Whether two records are the same variant and may share a ledger slot.
	pub fn same_variant(&self, other: &DomainRecord) -> bool {
		self.variant() == other.variant()
	}
}

/// Error types for the audit engine
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
	#[error("relay error: {0}")]
	Relay(#[from] RelayError),

	#[error("ledger store error: {0}")]
	Store(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	// A ledger key may only ever hold one record variant. Hitting this means
	// the wrong persisted file was loaded or extractors were mixed in one run.
	#[error("record variant mismatch for ledger key {key}")]
	RecordVariantMismatch { key: String },
}

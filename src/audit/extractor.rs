use crate::audit::types::{BalanceRecord, DomainRecord, TransactionCategory, TransactionRecord};
use crate::relay::{Filter, RawEvent};

/// Replaceable event kind carrying per-account balance snapshots.
pub const BALANCE_EVENT_KIND: u32 = 31111;
/// Event kind carrying ledger transaction records.
pub const TRANSACTION_EVENT_KIND: u32 = 1112;
/// Balance and transaction amounts arrive in millisats.
pub const MILLISATS_PER_SAT: u64 = 1000;

/// `t` tag values marking a settled transaction outcome.
pub const TRANSACTION_STATUS_TAGS: [&str; 6] = [
	"internal-transaction-ok",
	"internal-transaction-error",
	"inbound-transaction-ok",
	"inbound-transaction-error",
	"outbound-transaction-ok",
	"outbound-transaction-error",
];

/// Capability to turn raw relay events into domain records.
///
/// An extractor owns both sides of one audit mode: the subscription filter
/// that selects its events on the relay, and the extraction rule that turns a
/// matching event into a record. Extraction is total - events that do not
/// match the expected schema come back as `None` and the run continues; an
/// open relay carries unrelated events through the same kind filter.
pub trait RecordExtractor: Send + Sync {
	/// Build the subscription filter template for this audit mode.
	fn filter(&self, limit: u64) -> Filter;

	/// Extract a domain record, or reject the event.
	fn extract(&self, event: &RawEvent) -> Option<DomainRecord>;

	/// Get the name of this extractor
	fn name(&self) -> &'static str;
}

/// Extracts per-account balance snapshots from kind-31111 events.
pub struct BalanceExtractor {
	asset: String,
}

impl BalanceExtractor {
	pub fn new(asset: impl Into<String>) -> Self {
		Self { asset: asset.into() }
	}
}

impl RecordExtractor for BalanceExtractor {
	fn filter(&self, limit: u64) -> Filter {
		Filter::new(vec![BALANCE_EVENT_KIND], limit)
	}

	fn extract(&self, event: &RawEvent) -> Option<DomainRecord> {
		// `d` tag shape: "balance:<ASSET>:<account>"; the account is the third
		// segment exactly, further colon-separated segments are not part of it.
		let d_value = event.tag_value("d")?;
		let mut parts = d_value.split(':');
		if parts.next() != Some("balance") || parts.next() != Some(self.asset.as_str()) {
			return None;
		}
		let account = parts.next().filter(|a| !a.is_empty())?;

		let millisats: u64 = event.tag_value("amount")?.parse().ok()?;

		Some(DomainRecord::Balance(BalanceRecord {
			account: account.to_string(),
			sats: millisats / MILLISATS_PER_SAT,
			updated_at: event.created_at,
		}))
	}

	fn name(&self) -> &'static str {
		"BalanceExtractor"
	}
}

/// Extracts ledger transactions from kind-1112 events.
pub struct TransactionExtractor {
	asset: String,
	ledger_pubkey: Option<String>,
}

impl TransactionExtractor {
	pub fn new(asset: impl Into<String>, ledger_pubkey: Option<String>) -> Self {
		Self {
			asset: asset.into(),
			ledger_pubkey,
		}
	}

	/// Amount for the configured asset from the event's JSON content.
	/// Ledgers have emitted both numbers and numeric strings here.
	fn content_amount(&self, content: &str) -> Option<u64> {
		let parsed: serde_json::Value = serde_json::from_str(content).ok()?;
		let raw = parsed.get("tokens")?.get(&self.asset)?;
		match raw {
			serde_json::Value::Number(n) => n.as_u64(),
			serde_json::Value::String(s) => s.parse().ok(),
			_ => None,
		}
	}
}

impl RecordExtractor for TransactionExtractor {
	fn filter(&self, limit: u64) -> Filter {
		let filter = Filter::new(vec![TRANSACTION_EVENT_KIND], limit).tag(
			"t",
			TRANSACTION_STATUS_TAGS
				.iter()
				.map(|s| s.to_string())
				.collect(),
		);
		match &self.ledger_pubkey {
			Some(pubkey) => filter.authors(vec![pubkey.clone()]),
			None => filter,
		}
	}

	fn extract(&self, event: &RawEvent) -> Option<DomainRecord> {
		let status = event.tag_value("t")?;
		let counterparty = event.tag_value("p")?;
		let reference_id = event.tag_value("e")?;

		let millisats = self.content_amount(&event.content)?;
		if millisats == 0 {
			return None;
		}

		// `t` tag shape: "<category>-transaction-<outcome>"
		let mut segments = status.split('-');
		let category = TransactionCategory::parse(segments.next()?)?;
		let failed = segments.nth(1) == Some("error");

		Some(DomainRecord::Transaction(TransactionRecord {
			reference_id: reference_id.to_string(),
			counterparty: counterparty.to_string(),
			sats: millisats / MILLISATS_PER_SAT,
			category,
			failed,
			updated_at: event.created_at,
		}))
	}

	fn name(&self) -> &'static str {
		"TransactionExtractor"
	}
}

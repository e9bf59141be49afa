//! Ledger persistence for resumable audit runs.
//!
//! This module provides the store boundary the engine uses to seed a run from
//! previously persisted records and to write the ledger back after each
//! mutation batch. The on-disk shape is an ordered JSON array of records plus
//! a small sidecar metadata file; the engine treats the store as a plain
//! load/save surface and keeps no schema knowledge beyond the record type.

use crate::audit::types::{AuditError, DomainRecord};

use std::path::PathBuf;
use tracing::info;

/// Repository for persisted ledger records
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
	/// Load the previously persisted records, or `None` if nothing was saved.
	async fn load(&self) -> Result<Option<Vec<DomainRecord>>, AuditError>;

	/// Persist the current ledger contents.
	async fn save(&self, records: &[DomainRecord]) -> Result<(), AuditError>;
}

/// File-based implementation of LedgerStore
pub struct FileLedgerStore {
	data_dir: PathBuf,
	name: String,
}

impl FileLedgerStore {
	/// Store records under `<data_dir>/<name>.json`.
	pub fn new(data_dir: PathBuf, name: impl Into<String>) -> Self {
		Self {
			data_dir,
			name: name.into(),
		}
	}

	fn records_filename(&self) -> PathBuf {
		self.data_dir.join(format!("{}.json", self.name))
	}

	fn metadata_filename(&self) -> PathBuf {
		self.data_dir.join(format!("{}.meta.json", self.name))
	}
}

#[async_trait::async_trait]
impl LedgerStore for FileLedgerStore {
	async fn load(&self) -> Result<Option<Vec<DomainRecord>>, AuditError> {
		let filename = self.records_filename();
		if !filename.exists() {
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&filename).await?;
		let records: Vec<DomainRecord> = serde_json::from_str(&content).map_err(|e| {
			AuditError::Store(format!("Failed to parse ledger file {:?}: {}", filename, e))
		})?;

		info!("Loaded {} records from {:?}", records.len(), filename);
		Ok(Some(records))
	}

	async fn save(&self, records: &[DomainRecord]) -> Result<(), AuditError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;

		let metadata = serde_json::json!({
			"saved_at": chrono::Utc::now().to_rfc3339(),
			"records": records.len(),
		});
		tokio::fs::write(
			self.metadata_filename(),
			serde_json::to_string_pretty(&metadata)
				.map_err(|e| AuditError::Store(format!("Failed to serialize metadata: {}", e)))?,
		)
		.await?;

		let content = serde_json::to_string_pretty(records)
			.map_err(|e| AuditError::Store(format!("Failed to serialize ledger: {}", e)))?;
		let filename = self.records_filename();
		tokio::fs::write(&filename, content).await?;

		info!("Saved {} records to {:?}", records.len(), filename);
		Ok(())
	}
}

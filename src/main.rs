mod audit;
mod relay;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::{debug, error, info};

use crate::audit::events::{AuditEvent, AuditEventHandler};
use crate::audit::extractor::{BalanceExtractor, RecordExtractor, TransactionExtractor};
use crate::audit::store::{FileLedgerStore, LedgerStore};
use crate::audit::types::{AuditError, DomainRecord, TransactionCategory};
use crate::audit::{AuditConfig, AuditEngine};
use crate::relay::RelaySession;
use crate::utils::{format_btc, format_sats};

#[derive(Parser)]
#[command(name = "lawallet-auditor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Audit LaWallet balances and transactions recorded on a Nostr relay", long_about = None)]
struct Cli {
	/// Relay websocket URL to audit
	#[arg(long, default_value = "wss://relay.lawallet.ar")]
	relay: String,

	/// Events requested per pagination round
	#[arg(long, default_value_t = 500)]
	page_limit: u64,

	/// Directory for persisted ledger state
	#[arg(long, default_value = "data")]
	data_dir: PathBuf,

	/// Run without loading or saving ledger state
	#[arg(long)]
	no_persist: bool,

	/// Asset identifier inside balance tags and token payloads
	#[arg(long, default_value = "BTC")]
	asset: String,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Audit the latest balance snapshot of every account
	Balances,
	/// Audit the transaction history published by the ledger
	Transactions {
		/// Restrict the subscription to events authored by this ledger pubkey
		#[arg(long)]
		ledger_pubkey: Option<String>,
	},
}

/// Logs round boundaries and merge activity as the engine pulls the stream.
struct RunLogHandler;

#[async_trait::async_trait]
impl AuditEventHandler for RunLogHandler {
	async fn handle(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
		match event {
			AuditEvent::RecordMerged {
				key,
				outcome,
				total_sats,
				record_count,
			} => {
				debug!(
					"Merged {} ({:?}): {} records, {} sats total",
					key, outcome, record_count, total_sats
				);
			}
			AuditEvent::RoundCompleted {
				round,
				events_in_round,
				next_until,
			} => match next_until {
				Some(until) => info!(
					"Round {} delivered {} events, continuing until {}",
					round, events_in_round, until
				),
				None => info!(
					"Round {} delivered {} events, stream exhausted",
					round, events_in_round
				),
			},
			AuditEvent::AuditCompleted {
				rounds,
				record_count,
			} => {
				info!(
					"Audit finished after {} rounds with {} records",
					rounds, record_count
				);
			}
			AuditEvent::AuditFailed { error } => {
				error!("Audit failed: {}", error);
			}
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"RunLogHandler"
	}
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting relay audit against {}", cli.relay);

	let session = match RelaySession::open(&cli.relay).await {
		Ok(session) => session,
		Err(e) => {
			error!("Failed to connect to relay: {}", e);
			return;
		}
	};

	let (extractor, ledger_name): (Box<dyn RecordExtractor>, &str) = match &cli.command {
		Command::Balances => (
			Box::new(BalanceExtractor::new(cli.asset.clone())),
			"balances",
		),
		Command::Transactions { ledger_pubkey } => (
			Box::new(TransactionExtractor::new(
				cli.asset.clone(),
				ledger_pubkey.clone(),
			)),
			"transactions",
		),
	};

	let store: Option<Box<dyn LedgerStore>> = if cli.no_persist {
		None
	} else {
		Some(Box::new(FileLedgerStore::new(
			cli.data_dir.clone(),
			ledger_name,
		)))
	};

	let mut engine = AuditEngine::new(
		Box::new(session),
		extractor,
		store,
		AuditConfig {
			page_limit: cli.page_limit,
			..AuditConfig::default()
		},
	);
	engine.register_handler(Box::new(RunLogHandler));

	let cancel = engine.cancel_handle();
	tokio::spawn(async move {
		if signal::ctrl_c().await.is_ok() {
			info!("Interrupt received, stopping the audit");
			cancel.cancel();
		}
	});

	if let Err(e) = engine.run().await {
		error!("Audit run aborted: {}", e);
	}

	print_summary(&engine, matches!(cli.command, Command::Transactions { .. }));
}

fn print_summary(engine: &AuditEngine, with_categories: bool) {
	let stats = engine.current_stats();

	info!(
		"Ledger holds {} records worth {} sats ({} BTC)",
		format_sats(stats.record_count as u64),
		format_sats(stats.total_sats),
		format_btc(stats.total_sats)
	);
	info!(
		"Observed {} events over {} rounds: {} accepted, {} rejected, {} malformed frames",
		format_sats(stats.events_observed),
		stats.rounds_completed,
		format_sats(stats.events_accepted),
		format_sats(stats.events_rejected),
		stats.malformed_frames
	);
	if !stats.events_per_round.is_empty() {
		info!("  Events per round: {:?}", stats.events_per_round);
	}

	if with_categories {
		let transactions: Vec<_> = engine
			.current_ledger()
			.values()
			.filter_map(|record| match record {
				DomainRecord::Transaction(tx) => Some(tx),
				_ => None,
			})
			.collect();
		for category in [
			TransactionCategory::Inbound,
			TransactionCategory::Internal,
			TransactionCategory::Outbound,
		] {
			let matching = transactions.iter().filter(|tx| tx.category == category);
			let (count, sats) = matching.fold((0u64, 0u64), |(count, sats), tx| {
				(count + 1, sats + tx.sats)
			});
			info!(
				"  {}: {} transactions, {} sats",
				category.as_str(),
				format_sats(count),
				format_sats(sats)
			);
		}
		let failed = transactions.iter().filter(|tx| tx.failed).count() as u64;
		if failed > 0 {
			info!("  {} transactions ended in error", format_sats(failed));
		}
	}

	match (engine.is_run_complete(), engine.last_error()) {
		(true, _) => info!("Audit status: complete"),
		(false, Some(e)) => info!("Audit status: partial, aborted by error ({})", e),
		(false, None) => info!("Audit status: partial, cancelled"),
	}
}

//! Audit engine and integration point for all audit services.
//!
//! This module defines the `AuditEngine`, which coordinates one audit run
//! against a relay. It drives the paginated pull loop, routes raw events
//! through the record extractor, merges the results into the deduplicating
//! ledger, persists after every round, and dispatches progress events.
//!
//! The engine is responsible for:
//! - Seeding the ledger from the store before any new events arrive
//! - Issuing descending-cursor subscription rounds until the stream is
//!   exhausted
//! - Keeping the partial ledger valid and available on failure or
//!   cancellation
//! - Exposing the ledger, aggregates, and run status to the caller
//!
//! One engine owns one ledger for one run. Running balance and transaction
//! audits side by side means two engines; they share state only through the
//! explicit store boundary.

use crate::audit::events::{AuditEvent, AuditEventHandler, EventDispatcher};
use crate::audit::extractor::RecordExtractor;
use crate::audit::ledger::{AggregateStats, LedgerAggregator};
use crate::audit::progress::AuditProgress;
use crate::audit::store::LedgerStore;
use crate::audit::types::{AuditError, DomainRecord};
use crate::relay::{Frame, RelayError, RelayTransport};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Configuration for an audit run
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Result-count limit per subscription round.
    pub page_limit: u64,
    /// Pause between rounds, a throttle towards the relay.
    pub round_delay: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            page_limit: 500,
            round_delay: Duration::from_millis(100),
        }
    }
}

struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Handle to stop a running audit from outside the engine.
///
/// Cancellation takes effect mid-round or between rounds; the engine then
/// returns normally with a valid partial ledger and `is_run_complete()`
/// reporting false.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a cancel before the engine waits is
        // still observed.
        self.state.notify.notify_one();
    }
}

/// Combined run statistics: ledger aggregates plus pull-loop counters.
///
/// Everything here is recomputable from the ledger and the per-round
/// counters; nothing is tracked that could drift from them.
#[derive(Debug, Clone)]
pub struct AuditStats {
    pub total_sats: u64,
    pub record_count: usize,
    pub events_observed: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub malformed_frames: u64,
    pub rounds_completed: u64,
    pub events_per_round: Vec<u64>,
}

enum RoundEnd {
    /// The round filled the page; more stored events are likely pending.
    Full { oldest: i64 },
    /// The round came up short; the stream is exhausted.
    Short,
    Cancelled,
}

/// Coordinates one audit run: pagination, extraction, merging, persistence.
pub struct AuditEngine {
    transport: Box<dyn RelayTransport>,
    extractor: Box<dyn RecordExtractor>,
    store: Option<Box<dyn LedgerStore>>,
    dispatcher: EventDispatcher,
    config: AuditConfig,

    aggregator: LedgerAggregator,
    progress: AuditProgress,
    /// Exclusive upper-bound timestamp for the next round; absent on round 0.
    cursor: Option<i64>,
    complete: bool,
    last_error: Option<String>,
    cancel: Arc<CancelState>,
}

impl AuditEngine {
    pub fn new(
        transport: Box<dyn RelayTransport>,
        extractor: Box<dyn RecordExtractor>,
        store: Option<Box<dyn LedgerStore>>,
        config: AuditConfig,
    ) -> Self {
        Self {
            transport,
            extractor,
            store,
            dispatcher: EventDispatcher::new(),
            config,
            aggregator: LedgerAggregator::new(),
            progress: AuditProgress::new(),
            cursor: None,
            complete: false,
            last_error: None,
            cancel: Arc::new(CancelState {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Register an event handler for live progress reporting.
    pub fn register_handler(&mut self, handler: Box<dyn AuditEventHandler>) {
        self.dispatcher.register_handler(handler);
    }

    /// Handle for cancelling this run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            state: self.cancel.clone(),
        }
    }

    /// Run the audit to completion, cancellation, or failure.
    ///
    /// On failure the error is returned, but the ledger, stats, and
    /// rounds-completed remain valid and the partial ledger is persisted.
    pub async fn run(&mut self) -> Result<(), AuditError> {
        info!("Starting audit run with {}", self.extractor.name());

        if let Some(store) = &self.store {
            if let Some(records) = store.load().await? {
                info!("Seeding ledger with {} persisted records", records.len());
                for record in records {
                    self.aggregator.merge(record)?;
                }
            }
        }

        let result = self.run_rounds().await;

        match &result {
            Ok(true) => {
                self.complete = true;
                info!("Audit completed: {}", self.progress.summary());
                self.dispatcher
                    .dispatch(&AuditEvent::AuditCompleted {
                        rounds: self.progress.rounds_completed(),
                        record_count: self.aggregator.stats().record_count,
                    })
                    .await;
            }
            Ok(false) => {
                info!("Audit cancelled: {}", self.progress.summary());
            }
            Err(e) => {
                error!("Audit aborted: {} ({})", e, self.progress.summary());
                self.last_error = Some(e.to_string());
                self.dispatcher
                    .dispatch(&AuditEvent::AuditFailed {
                        error: e.to_string(),
                    })
                    .await;
            }
        }

        // The partial ledger survives every outcome.
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.aggregator.to_records()).await {
                warn!("Failed to persist ledger at end of run: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!("Error closing relay session: {}", e);
        }

        result.map(|_| ())
    }

    /// Drive subscription rounds until a short round, cancellation, or error.
    /// Returns whether the stream was fully consumed.
    async fn run_rounds(&mut self) -> Result<bool, AuditError> {
        loop {
            if self.cancel.flag.load(Ordering::SeqCst) {
                return Ok(false);
            }

            match self.run_round().await? {
                RoundEnd::Short => return Ok(true),
                RoundEnd::Cancelled => return Ok(false),
                RoundEnd::Full { oldest } => {
                    // Next round excludes the oldest timestamp seen. Events
                    // sharing that exact second with the cutoff are skipped;
                    // the cursor has one-second resolution.
                    self.cursor = Some(oldest - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.round_delay) => {}
                        _ = self.cancel.notify.notified() => return Ok(false),
                    }
                }
            }
        }
    }

    async fn run_round(&mut self) -> Result<RoundEnd, AuditError> {
        let filter = self
            .extractor
            .filter(self.config.page_limit)
            .until(self.cursor);
        let subscription_id = self.transport.subscribe(&filter).await?;
        debug!(
            "Round {} subscribed as {} (until: {:?})",
            self.progress.rounds_completed() + 1,
            subscription_id,
            self.cursor
        );

        let mut events_in_round = 0u64;
        let mut oldest: Option<i64> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = self.cancel.notify.notified() => {
                    cancelled = true;
                    break;
                }
                frame = self.transport.next_frame() => match frame? {
                    Some(Frame::Event { subscription_id: sub, event }) if sub == subscription_id => {
                        events_in_round += 1;
                        self.progress.record_observed();
                        oldest = Some(oldest.map_or(event.created_at, |o| o.min(event.created_at)));

                        match self.extractor.extract(&event) {
                            Some(record) => {
                                let key = record.business_key().to_string();
                                let outcome = self.aggregator.merge(record)?;
                                self.progress.record_accepted();
                                let AggregateStats {
                                    total_sats,
                                    record_count,
                                } = self.aggregator.stats();
                                self.dispatcher
                                    .dispatch(&AuditEvent::RecordMerged {
                                        key,
                                        outcome,
                                        total_sats,
                                        record_count,
                                    })
                                    .await;
                            }
                            None => self.progress.record_rejected(),
                        }
                        self.progress.log_progress(false);
                    }
                    Some(Frame::EndOfStoredEvents { subscription_id: sub }) if sub == subscription_id => break,
                    Some(Frame::Notice(text)) => debug!("Relay notice: {}", text),
                    Some(Frame::Malformed) => self.progress.record_malformed(),
                    // Frames for stale subscriptions and unknown messages.
                    Some(_) => {}
                    None => return Err(RelayError::Closed.into()),
                },
            }
        }

        if cancelled {
            if let Err(e) = self.transport.unsubscribe(&subscription_id).await {
                debug!("Error closing subscription on cancel: {}", e);
            }
            return Ok(RoundEnd::Cancelled);
        }

        self.transport.unsubscribe(&subscription_id).await?;
        self.progress.finish_round(events_in_round);

        if let Some(store) = &self.store {
            store.save(&self.aggregator.to_records()).await?;
        }

        let full = events_in_round >= self.config.page_limit && self.config.page_limit > 0;
        self.dispatcher
            .dispatch(&AuditEvent::RoundCompleted {
                round: self.progress.rounds_completed(),
                events_in_round,
                next_until: if full { oldest.map(|o| o - 1) } else { None },
            })
            .await;

        match (full, oldest) {
            (true, Some(oldest)) => Ok(RoundEnd::Full { oldest }),
            _ => Ok(RoundEnd::Short),
        }
    }

    /// The authoritative record per business key.
    pub fn current_ledger(&self) -> &BTreeMap<String, DomainRecord> {
        self.aggregator.records()
    }

    /// Aggregates and run counters, consistent with the latest merge.
    pub fn current_stats(&self) -> AuditStats {
        let AggregateStats {
            total_sats,
            record_count,
        } = self.aggregator.stats();
        AuditStats {
            total_sats,
            record_count,
            events_observed: self.progress.events_observed(),
            events_accepted: self.progress.events_accepted(),
            events_rejected: self.progress.events_rejected(),
            malformed_frames: self.progress.malformed_frames(),
            rounds_completed: self.progress.rounds_completed(),
            events_per_round: self.progress.events_per_round().to_vec(),
        }
    }

    pub fn rounds_completed(&self) -> u64 {
        self.progress.rounds_completed()
    }

    /// Whether the run consumed the relay's whole stored stream.
    pub fn is_run_complete(&self) -> bool {
        self.complete
    }

    /// Terminal failure of the last run, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::extractor::{
        BALANCE_EVENT_KIND, BalanceExtractor, TRANSACTION_EVENT_KIND, TransactionExtractor,
    };
    use crate::audit::ledger::MergeOutcome;
    use crate::audit::types::TransactionCategory;
    use crate::relay::{Filter, RawEvent};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Plays back scripted rounds of events without a network. Each
    /// subscription delivers the next round's events followed by EOSE; once
    /// the script runs out the connection reads as closed.
    struct ScriptedTransport {
        rounds: VecDeque<(Vec<RawEvent>, bool)>,
        filters: Arc<Mutex<Vec<Filter>>>,
        queue: VecDeque<Frame>,
        subscriptions: u64,
    }

    impl ScriptedTransport {
        fn new(rounds: Vec<(Vec<RawEvent>, bool)>, filters: Arc<Mutex<Vec<Filter>>>) -> Self {
            Self {
                rounds: rounds.into(),
                filters,
                queue: VecDeque::new(),
                subscriptions: 0,
            }
        }
    }

    #[async_trait::async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn subscribe(&mut self, filter: &Filter) -> Result<String, RelayError> {
            self.filters.lock().unwrap().push(filter.clone());
            self.subscriptions += 1;
            let subscription_id = format!("sub{}", self.subscriptions);
            if let Some((events, send_eose)) = self.rounds.pop_front() {
                for event in events {
                    self.queue.push_back(Frame::Event {
                        subscription_id: subscription_id.clone(),
                        event,
                    });
                }
                if send_eose {
                    self.queue.push_back(Frame::EndOfStoredEvents {
                        subscription_id: subscription_id.clone(),
                    });
                }
            }
            Ok(subscription_id)
        }

        async fn unsubscribe(&mut self, _subscription_id: &str) -> Result<(), RelayError> {
            Ok(())
        }

        async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError> {
            Ok(self.queue.pop_front())
        }

        async fn close(&mut self) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn balance_event(account: &str, millisats: u64, created_at: i64) -> RawEvent {
        RawEvent {
            id: format!("evt-{}-{}", account, created_at),
            kind: BALANCE_EVENT_KIND,
            pubkey: "ledger".to_string(),
            created_at,
            tags: vec![
                vec!["d".to_string(), format!("balance:BTC:{}", account)],
                vec!["amount".to_string(), millisats.to_string()],
            ],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn engine_with(
        rounds: Vec<(Vec<RawEvent>, bool)>,
        filters: Arc<Mutex<Vec<Filter>>>,
        page_limit: u64,
    ) -> AuditEngine {
        AuditEngine::new(
            Box::new(ScriptedTransport::new(rounds, filters)),
            Box::new(BalanceExtractor::new("BTC")),
            None,
            AuditConfig {
                page_limit,
                round_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn full_rounds_paginate_until_a_short_round() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let rounds = vec![
            (
                vec![balance_event("a", 1000, 100), balance_event("b", 1000, 90)],
                true,
            ),
            (
                vec![balance_event("c", 1000, 80), balance_event("d", 1000, 70)],
                true,
            ),
            (vec![balance_event("e", 1000, 60)], true),
        ];
        let mut engine = engine_with(rounds, filters.clone(), 2);

        engine.run().await.unwrap();

        assert!(engine.is_run_complete());
        assert_eq!(engine.rounds_completed(), 3);
        assert_eq!(engine.current_ledger().len(), 5);
        assert_eq!(engine.current_stats().events_per_round, vec![2, 2, 1]);

        let filters = filters.lock().unwrap();
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0].until, None);
        // Cursor of round k+1 is the minimum timestamp of round k, minus one.
        assert_eq!(filters[1].until, Some(89));
        assert_eq!(filters[2].until, Some(69));
    }

    #[tokio::test]
    async fn later_snapshot_wins_despite_lower_amount() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let rounds = vec![(
            vec![
                balance_event("abc", 500_000, 10),
                balance_event("abc", 250_000, 5),
            ],
            true,
        )];
        let mut engine = engine_with(rounds, filters, 500);

        engine.run().await.unwrap();

        let ledger = engine.current_ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger["abc"].sats(), 500);
        assert_eq!(ledger["abc"].timestamp(), 10);
        assert_eq!(engine.current_stats().total_sats, 500);
    }

    #[tokio::test]
    async fn transaction_audit_keys_by_referenced_event() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let event = RawEvent {
            id: "wrapper".to_string(),
            kind: TRANSACTION_EVENT_KIND,
            pubkey: "ledger".to_string(),
            created_at: 1000,
            tags: vec![
                vec!["t".to_string(), "inbound-transaction-ok".to_string()],
                vec!["p".to_string(), "alice".to_string()],
                vec!["e".to_string(), "tx1".to_string()],
            ],
            content: r#"{"tokens":{"BTC":3000}}"#.to_string(),
            sig: String::new(),
        };
        let mut engine = AuditEngine::new(
            Box::new(ScriptedTransport::new(vec![(vec![event], true)], filters)),
            Box::new(TransactionExtractor::new("BTC", None)),
            None,
            AuditConfig {
                page_limit: 500,
                round_delay: Duration::ZERO,
            },
        );

        engine.run().await.unwrap();

        let ledger = engine.current_ledger();
        match &ledger["tx1"] {
            DomainRecord::Transaction(t) => {
                assert_eq!(t.sats, 3);
                assert_eq!(t.category, TransactionCategory::Inbound);
                assert!(!t.failed);
            }
            other => panic!("expected transaction record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_matching_events_are_rejected_silently() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let mut stray = balance_event("a", 1000, 100);
        stray.tags.clear();
        let mut engine = engine_with(vec![(vec![stray], true)], filters, 500);

        engine.run().await.unwrap();

        assert!(engine.is_run_complete());
        assert!(engine.current_ledger().is_empty());
        let stats = engine.current_stats();
        assert_eq!(stats.events_observed, 1);
        assert_eq!(stats.events_rejected, 1);
        assert_eq!(stats.events_accepted, 0);
    }

    #[tokio::test]
    async fn transport_failure_preserves_partial_ledger() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        // Connection drops before EOSE arrives.
        let rounds = vec![(vec![balance_event("a", 1000, 100)], false)];
        let mut engine = engine_with(rounds, filters, 500);

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, AuditError::Relay(RelayError::Closed)));

        assert!(!engine.is_run_complete());
        assert!(engine.last_error().is_some());
        assert_eq!(engine.current_ledger().len(), 1);
        assert_eq!(engine.current_stats().events_observed, 1);
    }

    #[tokio::test]
    async fn cancellation_before_the_run_performs_no_rounds() {
        let filters = Arc::new(Mutex::new(Vec::new()));
        let mut engine = engine_with(
            vec![(vec![balance_event("a", 1000, 100)], true)],
            filters.clone(),
            500,
        );

        engine.cancel_handle().cancel();
        engine.run().await.unwrap();

        assert!(!engine.is_run_complete());
        assert_eq!(engine.rounds_completed(), 0);
        assert!(filters.lock().unwrap().is_empty());
    }

    /// Delivers its events for the first subscription, then stays silent like
    /// an idle connection. EOSE never arrives, so the round only ends by
    /// cancellation.
    struct StallingTransport {
        events: Vec<RawEvent>,
        queue: VecDeque<Frame>,
    }

    #[async_trait::async_trait]
    impl RelayTransport for StallingTransport {
        async fn subscribe(&mut self, _filter: &Filter) -> Result<String, RelayError> {
            let subscription_id = "sub1".to_string();
            for event in self.events.drain(..) {
                self.queue.push_back(Frame::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                });
            }
            Ok(subscription_id)
        }

        async fn unsubscribe(&mut self, _subscription_id: &str) -> Result<(), RelayError> {
            Ok(())
        }

        async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError> {
            match self.queue.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), RelayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn mid_round_cancellation_keeps_the_partial_ledger() {
        let mut engine = AuditEngine::new(
            Box::new(StallingTransport {
                events: vec![balance_event("abc", 500_000, 10)],
                queue: VecDeque::new(),
            }),
            Box::new(BalanceExtractor::new("BTC")),
            None,
            AuditConfig {
                page_limit: 500,
                round_delay: Duration::ZERO,
            },
        );

        let cancel = engine.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        engine.run().await.unwrap();

        // The record merged before the cancel survives; the interrupted round
        // is not counted.
        assert!(!engine.is_run_complete());
        assert!(engine.last_error().is_none());
        assert_eq!(engine.rounds_completed(), 0);
        assert_eq!(engine.current_ledger()["abc"].sats(), 500);
        assert_eq!(engine.current_stats().events_observed, 1);
    }

    #[tokio::test]
    async fn merge_events_are_dispatched_with_running_totals() {
        struct Capture {
            totals: Arc<Mutex<Vec<u64>>>,
        }

        #[async_trait::async_trait]
        impl AuditEventHandler for Capture {
            async fn handle(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
                if let AuditEvent::RecordMerged {
                    outcome, total_sats, ..
                } = event
                {
                    assert_ne!(*outcome, MergeOutcome::Updated);
                    self.totals.lock().unwrap().push(*total_sats);
                }
                Ok(())
            }

            fn name(&self) -> &'static str {
                "Capture"
            }
        }

        let totals = Arc::new(Mutex::new(Vec::new()));
        let filters = Arc::new(Mutex::new(Vec::new()));
        let rounds = vec![(
            vec![balance_event("a", 1000, 100), balance_event("b", 2000, 90)],
            true,
        )];
        let mut engine = engine_with(rounds, filters, 500);
        engine.register_handler(Box::new(Capture {
            totals: totals.clone(),
        }));

        engine.run().await.unwrap();

        assert_eq!(*totals.lock().unwrap(), vec![1, 3]);
    }
}

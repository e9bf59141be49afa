//! Event system for audit runs.
//!
//! This module defines the audit event types, the handler trait, and the
//! dispatcher used to decouple the engine's pull loop from whatever consumes
//! its progress - logging, live displays, metrics. The engine emits an event
//! after every accepted merge and at every round boundary, so a caller can
//! observe the ledger converging without polling the engine between frames.

use crate::audit::ledger::MergeOutcome;
use crate::audit::types::AuditError;

/// Events that occur during an audit run
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// A record was merged into the ledger.
    RecordMerged {
        key: String,
        outcome: MergeOutcome,
        total_sats: u64,
        record_count: usize,
    },
    /// A round finished and its page was fully consumed.
    RoundCompleted {
        round: u64,
        events_in_round: u64,
        /// Cursor for the next round, if one follows.
        next_until: Option<i64>,
    },
    /// The audit consumed the whole stream.
    AuditCompleted { rounds: u64, record_count: usize },
    /// The audit aborted; the partial ledger remains valid.
    AuditFailed { error: String },
}

/// Trait for handling audit events.
///
/// Implementors receive every event the engine dispatches and may perform
/// side effects. A failing handler is logged and skipped; it never stops the
/// run or other handlers.
#[async_trait::async_trait]
pub trait AuditEventHandler: Send + Sync {
    /// Handle one audit event.
    async fn handle(&mut self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn AuditEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn AuditEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    pub async fn dispatch(&mut self, event: &AuditEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
                // Continue processing with other handlers
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl AuditEventHandler for Recording {
        async fn handle(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Store("handler down".to_string()));
            }
            self.seen.lock().unwrap().push(format!("{:?}", event));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Recording"
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Box::new(Recording {
            seen: seen.clone(),
            fail: true,
        }));
        dispatcher.register_handler(Box::new(Recording {
            seen: seen.clone(),
            fail: false,
        }));

        dispatcher
            .dispatch(&AuditEvent::AuditCompleted {
                rounds: 1,
                record_count: 0,
            })
            .await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

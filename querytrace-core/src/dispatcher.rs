//! Event dispatcher and aggregation worker
//!
//! [`EventDispatcher`] is the single entry point for instrumentation
//! events. It runs on the caller's thread, so it only touches the
//! in-process table; completed queries are handed over a channel to
//! [`aggregate_completions`], which folds them into the server directory
//! on the runtime.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::aggregation::ServerDirectory;
use crate::events::InstrumentationEvent;
use crate::tracker::InProcessQueryTable;
use crate::types::CompletedQuery;

/// Counters kept by the dispatcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events received
    pub events: u64,
    /// Queries completed and handed to the aggregation worker
    pub completed: u64,
    /// Completed queries dropped because the dispatcher was closed
    pub dropped: u64,
}

pub struct EventDispatcher {
    table: InProcessQueryTable,
    completions: RwLock<Option<UnboundedSender<CompletedQuery>>>,
    events: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(table: InProcessQueryTable, completions: UnboundedSender<CompletedQuery>) -> Self {
        Self {
            table,
            completions: RwLock::new(Some(completions)),
            events: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Handle an event observed now.
    pub fn dispatch(&self, event: InstrumentationEvent) {
        self.dispatch_at(event, Utc::now());
    }

    /// Handle an event observed at `at` (replayed logs carry their own times).
    pub fn dispatch_at(&self, event: InstrumentationEvent, at: DateTime<Utc>) {
        self.events.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            kind = event.kind(),
            connection_id = event.connection_id(),
            thread_id = ?event.thread_id(),
            "Dispatching event"
        );

        let table = &self.table;
        match event {
            InstrumentationEvent::ConnectionOpened {
                connection_id,
                thread_id,
                connection_string,
            } => table.on_connection_opened(connection_id, thread_id, &connection_string),
            InstrumentationEvent::ConnectionClosed { connection_id } => {
                table.on_connection_closed(connection_id)
            }
            InstrumentationEvent::DatabaseChanged {
                connection_id,
                database,
            } => table.on_database_changed(connection_id, &database),
            InstrumentationEvent::QueryOpened {
                connection_id,
                thread_id,
                sql,
            } => table.on_query_opened(connection_id, thread_id, &sql, at),
            InstrumentationEvent::StatementPrepared {
                connection_id,
                statement_id,
                sql,
            } => table.on_statement_prepared(connection_id, statement_id, &sql),
            InstrumentationEvent::StatementExecuted {
                connection_id,
                thread_id,
                statement_id,
            } => table.on_statement_executed(connection_id, thread_id, statement_id, at),
            InstrumentationEvent::StatementClosed {
                connection_id,
                statement_id,
            } => table.on_statement_closed(connection_id, statement_id),
            InstrumentationEvent::QueryNormalizedByDriver {
                connection_id,
                thread_id,
                text,
            } => table.on_query_normalized_by_driver(connection_id, thread_id, &text),
            InstrumentationEvent::ResultOpened {
                connection_id,
                thread_id,
                affected_rows,
                ..
            } => table.on_result_opened(connection_id, thread_id, affected_rows, at),
            InstrumentationEvent::ResultClosed {
                connection_id,
                thread_id,
                rows,
                skipped,
                bytes,
            } => table.on_result_closed(connection_id, thread_id, rows, skipped, bytes),
            InstrumentationEvent::Warning {
                connection_id,
                thread_id,
                ..
            } => table.on_warning(connection_id, thread_id),
            InstrumentationEvent::Error {
                connection_id,
                thread_id,
                ..
            } => table.on_error(connection_id, thread_id),
            InstrumentationEvent::UsageAdvisorWarning {
                connection_id,
                thread_id,
                flag,
            } => table.on_usage_advisor_warning(connection_id, thread_id, flag),
            InstrumentationEvent::QueryClosed {
                connection_id,
                thread_id,
            } => {
                if let Some(completed) = table.on_query_closed(connection_id, thread_id, at) {
                    self.hand_off(completed);
                }
            }
        }
    }

    fn hand_off(&self, completed: CompletedQuery) {
        let sent = match self.completions.read().as_ref() {
            Some(sender) => sender.send(completed).is_ok(),
            None => false,
        };
        if sent {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Dispatcher closed, dropping completed query");
        }
    }

    /// Stop handing off completions. The aggregation worker drains what
    /// was already sent and exits.
    pub fn close(&self) {
        if self.completions.write().take().is_some() {
            tracing::debug!("Event dispatcher closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.completions.read().is_none()
    }

    pub fn table(&self) -> &InProcessQueryTable {
        &self.table
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events: self.events.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Drain completed queries into the directory until every sender is gone.
/// Returns the number of queries recorded.
pub async fn aggregate_completions(
    mut completions: UnboundedReceiver<CompletedQuery>,
    directory: Arc<ServerDirectory>,
) -> u64 {
    tracing::debug!("Aggregation worker started");
    let mut recorded = 0;
    while let Some(completed) = completions.recv().await {
        directory.record(&completed);
        recorded += 1;
    }
    tracing::debug!(recorded, "Aggregation worker finished");
    recorded
}

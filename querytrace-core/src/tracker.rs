//! In-process query table
//!
//! Tracks every query that is currently executing, keyed by connection id
//! and server thread id, until its close event turns it into a
//! [`CompletedQuery`].
//!
//! ## Locking
//!
//! The connection map is read-mostly and sits behind an `RwLock`; each
//! connection's state has its own `Mutex`. Callers on different
//! connections only share the read lock, so many connections can report
//! concurrently without a global bottleneck.
//!
//! ## Sequence errors
//!
//! The driver's instrumentation is best effort. Events for unknown
//! connections, results closed without being opened, and duplicate closes
//! are logged and ignored. Nothing here returns an error.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use crate::events::UsageAdvisorFlag;
use crate::normalizer::{QueryNormalizer, QueryType};
use crate::types::{CompletedQuery, DriverConnection, ServerKey};

/// Queries that may be open at once on one thread: a statement plus one
/// nested statement (`SHOW WARNINGS` issued while its result is open).
const MAX_NESTING: usize = 2;

/// Table of in-flight queries.
pub struct InProcessQueryTable {
    normalizer: QueryNormalizer,
    calling_host: String,
    connections: RwLock<HashMap<u64, Arc<Mutex<ConnectionState>>>>,
}

struct ConnectionState {
    connection: DriverConnection,
    /// Thread that last opened a query, used for events without a thread id
    last_thread: Option<u32>,
    /// Open queries per thread, innermost last
    queries: HashMap<Option<u32>, Vec<InProcessQuery>>,
    /// Server-side prepared statements by statement id
    prepared: HashMap<u32, String>,
}

impl ConnectionState {
    fn thread(&self, thread_id: Option<u32>) -> Option<u32> {
        thread_id.or(self.last_thread)
    }

    fn active(&mut self, thread_id: Option<u32>) -> Option<&mut InProcessQuery> {
        let thread = self.thread(thread_id);
        self.queries.get_mut(&thread).and_then(|stack| stack.last_mut())
    }

    fn open_count(&self) -> usize {
        self.queries.values().map(Vec::len).sum()
    }
}

struct InProcessQuery {
    sql: String,
    text: String,
    query_type: QueryType,
    driver_text: Option<String>,
    server: ServerKey,
    opened_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    results: Vec<OpenResult>,
    totals: Totals,
}

struct OpenResult {
    affected_rows: i64,
    no_index: bool,
    bad_index: bool,
}

#[derive(Default)]
struct Totals {
    rows: u64,
    skipped_rows: u64,
    bytes: u64,
    warnings: u64,
    errors: u64,
    no_index_used: u64,
    no_good_index_used: u64,
    result_count: u32,
}

impl InProcessQueryTable {
    pub fn new(normalizer: QueryNormalizer, calling_host: impl Into<String>) -> Self {
        Self {
            normalizer,
            calling_host: calling_host.into(),
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn connection(&self, connection_id: u64) -> Option<Arc<Mutex<ConnectionState>>> {
        let found = self.connections.read().get(&connection_id).cloned();
        if found.is_none() {
            tracing::debug!(connection_id, "Ignoring event for unknown connection");
        }
        found
    }

    pub fn on_connection_opened(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        connection_string: &str,
    ) {
        let connection = DriverConnection::parse(connection_string, thread_id);
        tracing::debug!(
            connection_id,
            host = %connection.host,
            database = %connection.database,
            "Connection opened"
        );
        let state = ConnectionState {
            connection,
            last_thread: thread_id,
            queries: HashMap::new(),
            prepared: HashMap::new(),
        };
        let previous = self
            .connections
            .write()
            .insert(connection_id, Arc::new(Mutex::new(state)));
        if previous.is_some() {
            tracing::warn!(connection_id, "Connection reopened, dropping its previous state");
        }
    }

    pub fn on_connection_closed(&self, connection_id: u64) {
        let Some(state) = self.connections.write().remove(&connection_id) else {
            tracing::debug!(connection_id, "Close for unknown connection");
            return;
        };
        let mut state = state.lock();
        state.prepared.clear();
        let discarded = state.open_count();
        if discarded > 0 {
            tracing::debug!(connection_id, discarded, "Discarded in-flight queries of closed connection");
        }
    }

    /// Later queries on the connection count against the new database.
    pub fn on_database_changed(&self, connection_id: u64, database: &str) {
        if let Some(state) = self.connection(connection_id) {
            state.lock().connection.database = database.to_string();
        }
    }

    pub fn on_query_opened(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        sql: &str,
        at: DateTime<Utc>,
    ) {
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let normalized = self.normalizer.normalize(sql);

        let mut state = state.lock();
        let thread = state.thread(thread_id);
        state.last_thread = thread;
        let query = InProcessQuery {
            sql: sql.to_string(),
            text: normalized.text,
            query_type: normalized.query_type,
            driver_text: None,
            server: state.connection.server_key(),
            opened_at: at,
            stopped_at: None,
            results: Vec::new(),
            totals: Totals::default(),
        };

        let stack = state.queries.entry(thread).or_default();
        if stack.len() >= MAX_NESTING {
            let dropped = stack.remove(0);
            tracing::warn!(
                connection_id,
                thread_id = ?thread,
                dropped = %dropped.text,
                "Query opened with {} queries already open, dropping the oldest",
                MAX_NESTING
            );
        }
        stack.push(query);
    }

    pub fn on_statement_prepared(&self, connection_id: u64, statement_id: u32, sql: &str) {
        if let Some(state) = self.connection(connection_id) {
            let previous = state.lock().prepared.insert(statement_id, sql.to_string());
            if previous.is_some() {
                tracing::debug!(
                    connection_id,
                    statement_id,
                    "Statement id prepared twice, keeping the latest"
                );
            }
        }
    }

    /// Opens a query carrying the prepared statement's SQL.
    pub fn on_statement_executed(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        statement_id: u32,
        at: DateTime<Utc>,
    ) {
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let sql = state.lock().prepared.get(&statement_id).cloned();
        match sql {
            Some(sql) => self.on_query_opened(connection_id, thread_id, &sql, at),
            None => tracing::debug!(
                connection_id,
                statement_id,
                "Execution of unknown prepared statement"
            ),
        }
    }

    pub fn on_statement_closed(&self, connection_id: u64, statement_id: u32) {
        if let Some(state) = self.connection(connection_id) {
            if state.lock().prepared.remove(&statement_id).is_none() {
                tracing::debug!(
                    connection_id,
                    statement_id,
                    "Close for unknown prepared statement"
                );
            }
        }
    }

    /// Prepared statements currently held by `connection_id`.
    pub fn prepared_count(&self, connection_id: u64) -> usize {
        self.connections
            .read()
            .get(&connection_id)
            .map_or(0, |state| state.lock().prepared.len())
    }

    pub fn on_query_normalized_by_driver(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        text: &str,
    ) {
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let mut state = state.lock();
        match state.active(thread_id) {
            Some(query) => query.driver_text = Some(text.to_string()),
            None => tracing::debug!(connection_id, "Driver normalization with no open query"),
        }
    }

    pub fn on_result_opened(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        affected_rows: i64,
        at: DateTime<Utc>,
    ) {
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let mut state = state.lock();
        let Some(query) = state.active(thread_id) else {
            tracing::debug!(connection_id, "Result opened with no open query");
            return;
        };
        query.stopped_at.get_or_insert(at);
        query.results.push(OpenResult {
            affected_rows,
            no_index: false,
            bad_index: false,
        });
    }

    pub fn on_result_closed(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        rows: u64,
        skipped: u64,
        bytes: u64,
    ) {
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let mut state = state.lock();
        let Some(query) = state.active(thread_id) else {
            tracing::debug!(connection_id, "Result closed with no open query");
            return;
        };
        let Some(result) = query.results.pop() else {
            tracing::debug!(connection_id, "Result closed without being opened");
            return;
        };

        let totals = &mut query.totals;
        totals.rows = totals
            .rows
            .saturating_add(result.affected_rows.max(0) as u64)
            .saturating_add(rows);
        totals.skipped_rows = totals.skipped_rows.saturating_add(skipped);
        totals.bytes = totals.bytes.saturating_add(bytes);
        totals.result_count += 1;
        if result.no_index {
            totals.no_index_used += 1;
        }
        if result.bad_index {
            totals.no_good_index_used += 1;
        }
    }

    pub fn on_warning(&self, connection_id: u64, thread_id: Option<u32>) {
        if let Some(state) = self.connection(connection_id) {
            if let Some(query) = state.lock().active(thread_id) {
                query.totals.warnings += 1;
            }
        }
    }

    pub fn on_error(&self, connection_id: u64, thread_id: Option<u32>) {
        if let Some(state) = self.connection(connection_id) {
            if let Some(query) = state.lock().active(thread_id) {
                query.totals.errors += 1;
            }
        }
    }

    pub fn on_usage_advisor_warning(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        flag: UsageAdvisorFlag,
    ) {
        if !flag.is_index_flag() {
            tracing::debug!(connection_id, ?flag, "Usage advisor warning");
            return;
        }
        let Some(state) = self.connection(connection_id) else {
            return;
        };
        let mut state = state.lock();
        let Some(query) = state.active(thread_id) else {
            return;
        };

        let no_index = flag == UsageAdvisorFlag::NoIndex;
        match query.results.last_mut() {
            Some(result) if no_index => result.no_index = true,
            Some(result) => result.bad_index = true,
            None if no_index => query.totals.no_index_used += 1,
            None => query.totals.no_good_index_used += 1,
        }
    }

    /// Pops the innermost open query on the thread.
    pub fn on_query_closed(
        &self,
        connection_id: u64,
        thread_id: Option<u32>,
        at: DateTime<Utc>,
    ) -> Option<CompletedQuery> {
        let state = self.connection(connection_id)?;
        let mut state = state.lock();
        let thread = state.thread(thread_id);

        let Some(stack) = state.queries.get_mut(&thread) else {
            tracing::debug!(connection_id, thread_id = ?thread, "Close for query that is not open");
            return None;
        };
        let query = stack.pop()?;
        if stack.is_empty() {
            state.queries.remove(&thread);
        }

        let stopped_at = query.stopped_at.unwrap_or(at);
        let totals = query.totals;
        Some(CompletedQuery {
            connection_id,
            thread_id: thread,
            server: query.server,
            text: query.driver_text.unwrap_or(query.text),
            full_text: query.sql,
            query_type: query.query_type,
            rows: totals.rows,
            skipped_rows: totals.skipped_rows,
            bytes: totals.bytes,
            warnings: totals.warnings,
            errors: totals.errors,
            no_index_used: totals.no_index_used,
            no_good_index_used: totals.no_good_index_used,
            result_count: totals.result_count,
            exec_time: (stopped_at - query.opened_at).to_std().unwrap_or_default(),
            started_at: query.opened_at,
            calling_host: self.calling_host.clone(),
        })
    }

    /// Number of queries currently open across all connections.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .values()
            .map(|state| state.lock().open_count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::KeywordTable;
    use chrono::TimeZone;

    const CONN: &str = "server=localhost;uid=root;database=mydb";

    fn table() -> InProcessQueryTable {
        InProcessQueryTable::new(
            QueryNormalizer::new(Arc::new(KeywordTable::mysql())),
            "app-01",
        )
    }

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_simple_query_lifecycle() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        assert_eq!(table.len(), 1);
        table.on_result_opened(1, Some(1), -1, t(5));
        table.on_result_closed(1, Some(1), 1, 0, 76);
        let done = table.on_query_closed(1, Some(1), t(9)).unwrap();

        assert!(table.is_empty());
        assert_eq!(done.text, "SELECT ?");
        assert_eq!(done.full_text, "SELECT 1");
        assert_eq!(done.query_type, QueryType::Select);
        assert_eq!(done.rows, 1);
        assert_eq!(done.bytes, 76);
        assert_eq!(done.server, ServerKey::new("localhost", "root", "mydb"));
        assert_eq!(done.exec_time, std::time::Duration::from_millis(5));
        assert_eq!(done.calling_host, "app-01");
    }

    #[test]
    fn test_exec_time_runs_to_close_without_results() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SET autocommit = 1", t(0));
        let done = table.on_query_closed(1, Some(1), t(12)).unwrap();
        assert_eq!(done.exec_time, std::time::Duration::from_millis(12));
        assert_eq!(done.result_count, 0);
    }

    #[test]
    fn test_affected_rows_count_towards_rows() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "UPDATE t SET a = 1", t(0));
        table.on_result_opened(1, Some(1), 7, t(1));
        table.on_result_closed(1, Some(1), 0, 0, 11);
        let done = table.on_query_closed(1, Some(1), t(2)).unwrap();
        assert_eq!(done.rows, 7);
    }

    #[test]
    fn test_multiple_results_accumulate() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "call spTest1()", t(0));
        for (rows, bytes) in [(10, 200), (55, 250), (34, 312)] {
            table.on_result_opened(1, Some(1), 0, t(1));
            table.on_result_closed(1, Some(1), rows, 0, bytes);
        }
        let done = table.on_query_closed(1, Some(1), t(3)).unwrap();
        assert_eq!(done.rows, 99);
        assert_eq!(done.bytes, 762);
        assert_eq!(done.result_count, 3);
        assert_eq!(done.query_type, QueryType::Call);
    }

    #[test]
    fn test_index_flags_counted_once_per_result() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_result_opened(1, Some(1), -1, t(1));
        table.on_usage_advisor_warning(1, Some(1), UsageAdvisorFlag::NoIndex);
        table.on_usage_advisor_warning(1, Some(1), UsageAdvisorFlag::NoIndex);
        table.on_usage_advisor_warning(1, Some(1), UsageAdvisorFlag::BadIndex);
        table.on_usage_advisor_warning(1, Some(1), UsageAdvisorFlag::SkippedRows);
        table.on_result_closed(1, Some(1), 1, 0, 76);
        let done = table.on_query_closed(1, Some(1), t(2)).unwrap();
        assert_eq!(done.no_index_used, 1);
        assert_eq!(done.no_good_index_used, 1);
    }

    #[test]
    fn test_nested_query_and_parent_warnings() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_result_opened(1, Some(1), -1, t(1));
        table.on_result_closed(1, Some(1), 1, 0, 76);
        table.on_query_opened(1, Some(1), "SHOW WARNINGS", t(2));
        table.on_result_opened(1, Some(1), -1, t(3));
        table.on_result_closed(1, Some(1), 0, 0, 55);
        let child = table.on_query_closed(1, Some(1), t(4)).unwrap();
        assert_eq!(child.text, "SHOW WARNINGS");

        table.on_warning(1, Some(1));
        table.on_warning(1, Some(1));
        table.on_error(1, Some(1));
        let parent = table.on_query_closed(1, Some(1), t(5)).unwrap();
        assert_eq!(parent.text, "SELECT ?");
        assert_eq!(parent.warnings, 2);
        assert_eq!(parent.errors, 1);
    }

    #[test]
    fn test_third_level_drops_oldest() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_query_opened(1, Some(1), "SELECT 2", t(1));
        table.on_query_opened(1, Some(1), "SHOW WARNINGS", t(2));
        assert_eq!(table.len(), 2);

        let first = table.on_query_closed(1, Some(1), t(3)).unwrap();
        let second = table.on_query_closed(1, Some(1), t(3)).unwrap();
        assert_eq!(first.full_text, "SHOW WARNINGS");
        assert_eq!(second.full_text, "SELECT 2");
        assert!(table.on_query_closed(1, Some(1), t(3)).is_none());
    }

    #[test]
    fn test_driver_normalization_wins() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_query_normalized_by_driver(1, Some(1), "this is my normalized sql");
        let done = table.on_query_closed(1, Some(1), t(1)).unwrap();
        assert_eq!(done.text, "this is my normalized sql");
        assert_eq!(done.full_text, "SELECT 1");
    }

    #[test]
    fn test_database_change_applies_to_later_queries() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_database_changed(1, "other");
        let first = table.on_query_closed(1, Some(1), t(1)).unwrap();
        table.on_query_opened(1, Some(1), "SELECT 1", t(2));
        let second = table.on_query_closed(1, Some(1), t(3)).unwrap();
        assert_eq!(first.server.database, "mydb");
        assert_eq!(second.server.database, "other");
    }

    #[test]
    fn test_sequence_errors_are_ignored() {
        let table = table();
        // never opened
        table.on_query_opened(9, Some(1), "SELECT 1", t(0));
        assert!(table.on_query_closed(9, Some(1), t(1)).is_none());

        table.on_connection_opened(1, Some(1), CONN);
        table.on_result_closed(1, Some(1), 5, 0, 10);
        assert!(table.on_query_closed(1, Some(1), t(1)).is_none());

        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_result_closed(1, Some(1), 5, 0, 10);
        let done = table.on_query_closed(1, Some(1), t(1)).unwrap();
        assert_eq!(done.rows, 0);
        assert!(table.on_query_closed(1, Some(1), t(2)).is_none());
    }

    #[test]
    fn test_prepared_statement_executions() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_statement_prepared(1, 4, "SELECT * FROM t WHERE id = ?");
        assert_eq!(table.prepared_count(1), 1);

        for i in 0..2 {
            table.on_statement_executed(1, Some(1), 4, t(i * 10));
            table.on_result_opened(1, Some(1), -1, t(i * 10 + 3));
            table.on_result_closed(1, Some(1), 2, 0, 40);
            let done = table.on_query_closed(1, Some(1), t(i * 10 + 5)).unwrap();
            assert_eq!(done.text, "SELECT * FROM t WHERE id = ?");
            assert_eq!(done.full_text, "SELECT * FROM t WHERE id = ?");
            assert_eq!(done.rows, 2);
        }

        table.on_statement_closed(1, 4);
        assert_eq!(table.prepared_count(1), 0);
        table.on_statement_executed(1, Some(1), 4, t(50));
        assert!(table.is_empty());
    }

    #[test]
    fn test_connection_close_forgets_prepared_statements() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_statement_prepared(1, 1, "SELECT 1");
        table.on_statement_prepared(1, 2, "SELECT 2");
        assert_eq!(table.prepared_count(1), 2);

        table.on_connection_closed(1);
        assert_eq!(table.prepared_count(1), 0);

        table.on_connection_opened(1, Some(1), CONN);
        table.on_statement_executed(1, Some(1), 1, t(0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_huge_counts_saturate() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "CALL big()", t(0));
        for _ in 0..2 {
            table.on_result_opened(1, Some(1), i64::MAX, t(1));
            table.on_result_closed(1, Some(1), u64::MAX, u64::MAX, u64::MAX);
        }
        let done = table.on_query_closed(1, Some(1), t(2)).unwrap();
        assert_eq!(done.rows, u64::MAX);
        assert_eq!(done.skipped_rows, u64::MAX);
        assert_eq!(done.bytes, u64::MAX);
        assert_eq!(done.result_count, 2);
    }

    #[test]
    fn test_driver_normalization_without_open_query() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_normalized_by_driver(1, Some(1), "SELECT :p");
        table.on_query_opened(1, Some(1), "SELECT 5", t(0));
        let done = table.on_query_closed(1, Some(1), t(1)).unwrap();
        assert_eq!(done.text, "SELECT ?");
    }

    #[test]
    fn test_missing_thread_id_uses_last_thread() {
        let table = table();
        table.on_connection_opened(1, Some(7), CONN);
        table.on_query_opened(1, None, "SELECT 1", t(0));
        table.on_result_opened(1, Some(7), -1, t(1));
        table.on_result_closed(1, None, 3, 0, 30);
        let done = table.on_query_closed(1, Some(7), t(2)).unwrap();
        assert_eq!(done.thread_id, Some(7));
        assert_eq!(done.rows, 3);
    }

    #[test]
    fn test_connection_close_discards_queries() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_connection_closed(1);
        assert!(table.is_empty());
        assert_eq!(table.connection_count(), 0);
        assert!(table.on_query_closed(1, Some(1), t(1)).is_none());
    }

    #[test]
    fn test_threads_are_independent() {
        let table = table();
        table.on_connection_opened(1, Some(1), CONN);
        table.on_query_opened(1, Some(1), "SELECT 1", t(0));
        table.on_query_opened(1, Some(2), "SELECT 2", t(0));
        table.on_result_opened(1, Some(2), -1, t(1));
        table.on_result_closed(1, Some(2), 4, 0, 40);

        let one = table.on_query_closed(1, Some(1), t(2)).unwrap();
        let two = table.on_query_closed(1, Some(2), t(2)).unwrap();
        assert_eq!(one.rows, 0);
        assert_eq!(two.rows, 4);
    }
}

//! Shared harness for the engine integration tests.
//!
//! Aggregation happens on the engine's runtime, so tests observe it through
//! [`wait_for`] instead of asserting immediately.

#![allow(dead_code)]

use parking_lot::Mutex;
use querytrace_core::aggregation::{ExplainRow, QueryAggregation, ServerAggregation};
use querytrace_core::config::Config;
use querytrace_core::error::{Error, Result};
use querytrace_core::poster::{PostResponse, ReportBatch, ReportSink};
use querytrace_core::{Engine, InstrumentationEvent, ServerInspector, ServerKey, UsageAdvisorFlag};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CONN_STR: &str = "server=localhost;uid=root;database=mydb";

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(5);
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(100));
    }
}

/// Inspector that records every statement it is asked to run.
#[derive(Default)]
pub struct RecordingInspector {
    pub uuid: Option<String>,
    pub fail_explain: bool,
    pub statements: Mutex<Vec<(ServerKey, String)>>,
    pub uuid_lookups: AtomicUsize,
}

impl RecordingInspector {
    pub fn with_uuid(uuid: &str) -> Self {
        Self {
            uuid: Some(uuid.to_string()),
            ..Default::default()
        }
    }

    pub fn failing_explain() -> Self {
        Self {
            fail_explain: true,
            ..Default::default()
        }
    }

    pub fn explained(&self) -> Vec<String> {
        self.statements
            .lock()
            .iter()
            .map(|(_, sql)| sql.clone())
            .filter(|sql| sql.starts_with("EXPLAIN "))
            .collect()
    }
}

impl ServerInspector for RecordingInspector {
    fn scalar(&self, server: &ServerKey, sql: &str) -> Result<Option<String>> {
        self.uuid_lookups.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().push((server.clone(), sql.to_string()));
        Ok(self.uuid.clone())
    }

    fn explain(&self, server: &ServerKey, sql: &str) -> Result<Vec<ExplainRow>> {
        self.statements.lock().push((server.clone(), sql.to_string()));
        if self.fail_explain {
            return Err(Error::Inspector("EXPLAIN denied".to_string()));
        }
        Ok(vec![ExplainRow {
            id: Some("1".to_string()),
            select_type: Some("SIMPLE".to_string()),
            table: Some("mytable".to_string()),
            access_type: Some("ALL".to_string()),
            rows: Some("42".to_string()),
            ..Default::default()
        }])
    }
}

/// Sink that keeps every batch in memory and can be told to fail.
#[derive(Default)]
pub struct MemorySink {
    pub batches: Mutex<Vec<ReportBatch>>,
    pub failures_left: AtomicUsize,
}

impl ReportSink for MemorySink {
    async fn send(&self, batch: &ReportBatch) -> Result<PostResponse> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Poster("API error (503): unavailable".to_string()));
        }
        self.batches.lock().push(batch.clone());
        Ok(PostResponse {
            accepted: batch.reports.len(),
            rejected: 0,
        })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.calling_host = Some("app-01".to_string());
    config
}

/// Engine plus the event helpers the aggregation scenarios are written in.
pub struct Harness {
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_inspector(Arc::new(RecordingInspector::default()))
    }

    pub fn with_inspector(inspector: Arc<dyn ServerInspector>) -> Self {
        querytrace_core::logging::init_test();
        let engine = Engine::start(&test_config(), inspector).expect("engine should start");
        Self { engine }
    }

    fn send(&self, event: InstrumentationEvent) {
        self.engine.dispatch(event);
    }

    pub fn open_connection(&self, connection_id: u64, connection_string: &str, thread_id: u32) {
        self.send(InstrumentationEvent::ConnectionOpened {
            connection_id,
            thread_id: Some(thread_id),
            connection_string: connection_string.to_string(),
        });
    }

    pub fn close_connection(&self, connection_id: u64) {
        self.send(InstrumentationEvent::ConnectionClosed { connection_id });
    }

    pub fn change_database(&self, connection_id: u64, database: &str) {
        self.send(InstrumentationEvent::DatabaseChanged {
            connection_id,
            database: database.to_string(),
        });
    }

    pub fn open_query(&self, connection_id: u64, thread_id: u32, sql: &str) {
        self.send(InstrumentationEvent::QueryOpened {
            connection_id,
            thread_id: Some(thread_id),
            sql: sql.to_string(),
        });
    }

    pub fn prepare_statement(&self, connection_id: u64, statement_id: u32, sql: &str) {
        self.send(InstrumentationEvent::StatementPrepared {
            connection_id,
            statement_id,
            sql: sql.to_string(),
        });
    }

    pub fn execute_statement(&self, connection_id: u64, thread_id: u32, statement_id: u32) {
        self.send(InstrumentationEvent::StatementExecuted {
            connection_id,
            thread_id: Some(thread_id),
            statement_id,
        });
    }

    pub fn close_statement(&self, connection_id: u64, statement_id: u32) {
        self.send(InstrumentationEvent::StatementClosed {
            connection_id,
            statement_id,
        });
    }

    pub fn normalized_by_driver(&self, connection_id: u64, thread_id: u32, text: &str) {
        self.send(InstrumentationEvent::QueryNormalizedByDriver {
            connection_id,
            thread_id: Some(thread_id),
            text: text.to_string(),
        });
    }

    pub fn open_result(&self, connection_id: u64, field_count: i32, affected_rows: i64) {
        self.send(InstrumentationEvent::ResultOpened {
            connection_id,
            thread_id: None,
            field_count,
            affected_rows,
            inserted_id: -1,
        });
    }

    pub fn close_result(&self, connection_id: u64, rows: u64, skipped: u64, bytes: u64) {
        self.send(InstrumentationEvent::ResultClosed {
            connection_id,
            thread_id: None,
            rows,
            skipped,
            bytes,
        });
    }

    pub fn close_query(&self, connection_id: u64) {
        self.send(InstrumentationEvent::QueryClosed {
            connection_id,
            thread_id: None,
        });
    }

    pub fn warning(&self, connection_id: u64) {
        self.send(InstrumentationEvent::Warning {
            connection_id,
            thread_id: None,
            level: Some("Warning".to_string()),
            code: Some(1265),
            message: Some("Data truncated".to_string()),
        });
    }

    pub fn error(&self, connection_id: u64) {
        self.send(InstrumentationEvent::Error {
            connection_id,
            thread_id: None,
            code: Some(1146),
            message: Some("Table doesn't exist".to_string()),
        });
    }

    pub fn usage_advisor(&self, connection_id: u64, flag: UsageAdvisorFlag) {
        self.send(InstrumentationEvent::UsageAdvisorWarning {
            connection_id,
            thread_id: None,
            flag,
        });
    }

    /// One statement with one result set.
    pub fn issue_simple_select(
        &self,
        sql: &str,
        connection_id: u64,
        field_count: i32,
        rows: u64,
        skipped: u64,
        bytes: u64,
    ) {
        self.open_query(connection_id, 1, sql);
        self.open_result(connection_id, field_count, -1);
        self.close_result(connection_id, rows, skipped, bytes);
        self.close_query(connection_id);
    }

    pub fn wait_for_servers(&self, count: usize) -> bool {
        let directory = self.engine.directory();
        wait_for(Duration::from_secs(5), || directory.len() >= count)
    }

    pub fn server(&self, index: usize) -> Arc<ServerAggregation> {
        assert!(self.wait_for_servers(index + 1), "server {} never appeared", index);
        self.engine
            .directory()
            .get(index)
            .expect("server should exist")
    }

    /// Query aggregation `index` of `server` once it has seen `count` executions.
    pub fn query(
        &self,
        server: &ServerAggregation,
        index: usize,
        count: u64,
    ) -> Arc<QueryAggregation> {
        assert!(
            wait_for(Duration::from_secs(5), || server
                .query(index)
                .is_some_and(|q| q.count() >= count)),
            "query {} never reached {} executions",
            index,
            count
        );
        server.query(index).expect("query should exist")
    }
}

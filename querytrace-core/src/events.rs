//! Instrumentation event schema
//!
//! The database driver reports what it is doing through these events. They
//! are ephemeral: the dispatcher folds each one into the in-process table
//! and drops it.
//!
//! Events serialize as internally tagged JSON so a captured stream can be
//! replayed later, one event per line:
//!
//! ```text
//! {"kind":"connection_opened","connection_id":1,"thread_id":11,"connection_string":"server=db1;uid=app;database=shop"}
//! {"kind":"query_opened","connection_id":1,"thread_id":11,"sql":"SELECT * FROM orders WHERE id = 42"}
//! {"kind":"result_opened","connection_id":1,"thread_id":11,"field_count":4,"affected_rows":-1,"inserted_id":-1}
//! {"kind":"result_closed","connection_id":1,"thread_id":11,"rows":1,"skipped":0,"bytes":120}
//! {"kind":"query_closed","connection_id":1,"thread_id":11}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage-advisor findings the driver attaches to an open result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAdvisorFlag {
    /// The server scanned without using any index
    NoIndex,
    /// The server picked an index but judged it a poor one
    BadIndex,
    /// The caller closed the result before reading every row
    SkippedRows,
    /// The caller never read some of the selected columns
    SkippedColumns,
    /// A field was fetched through a lossy type conversion
    FieldConversion,
}

impl UsageAdvisorFlag {
    /// Flags that feed the index counters of the summary.
    pub fn is_index_flag(&self) -> bool {
        matches!(self, UsageAdvisorFlag::NoIndex | UsageAdvisorFlag::BadIndex)
    }
}

/// One instrumentation event.
///
/// Every variant carries the driver's connection id. `thread_id` is the
/// server-side thread serving the connection, when the driver knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstrumentationEvent {
    ConnectionOpened {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        connection_string: String,
    },
    ConnectionClosed {
        connection_id: u64,
    },
    QueryOpened {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        sql: String,
    },
    /// The driver already normalized the statement itself.
    QueryNormalizedByDriver {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        text: String,
    },
    ResultOpened {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        field_count: i32,
        /// `-1` when unknown until the result is read (SELECT)
        affected_rows: i64,
        #[serde(default = "unknown_id")]
        inserted_id: i64,
    },
    ResultClosed {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        rows: u64,
        #[serde(default)]
        skipped: u64,
        bytes: u64,
    },
    QueryClosed {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
    },
    Warning {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        code: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },
    UsageAdvisorWarning {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        flag: UsageAdvisorFlag,
    },
    Error {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        #[serde(default)]
        code: Option<u32>,
        #[serde(default)]
        message: Option<String>,
    },
    /// The connection switched its default database (`USE other`).
    DatabaseChanged {
        connection_id: u64,
        database: String,
    },
    /// Server-side prepare. Executions refer back to it by `statement_id`.
    StatementPrepared {
        connection_id: u64,
        statement_id: u32,
        sql: String,
    },
    /// A prepared statement was executed; opens a query with its SQL.
    StatementExecuted {
        connection_id: u64,
        #[serde(default)]
        thread_id: Option<u32>,
        statement_id: u32,
    },
    StatementClosed {
        connection_id: u64,
        statement_id: u32,
    },
}

fn unknown_id() -> i64 {
    -1
}

impl InstrumentationEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            InstrumentationEvent::ConnectionOpened { connection_id, .. }
            | InstrumentationEvent::ConnectionClosed { connection_id }
            | InstrumentationEvent::QueryOpened { connection_id, .. }
            | InstrumentationEvent::QueryNormalizedByDriver { connection_id, .. }
            | InstrumentationEvent::ResultOpened { connection_id, .. }
            | InstrumentationEvent::ResultClosed { connection_id, .. }
            | InstrumentationEvent::QueryClosed { connection_id, .. }
            | InstrumentationEvent::Warning { connection_id, .. }
            | InstrumentationEvent::UsageAdvisorWarning { connection_id, .. }
            | InstrumentationEvent::Error { connection_id, .. }
            | InstrumentationEvent::DatabaseChanged { connection_id, .. }
            | InstrumentationEvent::StatementPrepared { connection_id, .. }
            | InstrumentationEvent::StatementExecuted { connection_id, .. }
            | InstrumentationEvent::StatementClosed { connection_id, .. } => *connection_id,
        }
    }

    pub fn thread_id(&self) -> Option<u32> {
        match self {
            InstrumentationEvent::ConnectionOpened { thread_id, .. }
            | InstrumentationEvent::QueryOpened { thread_id, .. }
            | InstrumentationEvent::QueryNormalizedByDriver { thread_id, .. }
            | InstrumentationEvent::ResultOpened { thread_id, .. }
            | InstrumentationEvent::ResultClosed { thread_id, .. }
            | InstrumentationEvent::QueryClosed { thread_id, .. }
            | InstrumentationEvent::Warning { thread_id, .. }
            | InstrumentationEvent::UsageAdvisorWarning { thread_id, .. }
            | InstrumentationEvent::Error { thread_id, .. }
            | InstrumentationEvent::StatementExecuted { thread_id, .. } => *thread_id,
            InstrumentationEvent::ConnectionClosed { .. }
            | InstrumentationEvent::DatabaseChanged { .. }
            | InstrumentationEvent::StatementPrepared { .. }
            | InstrumentationEvent::StatementClosed { .. } => None,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            InstrumentationEvent::ConnectionOpened { .. } => "connection_opened",
            InstrumentationEvent::ConnectionClosed { .. } => "connection_closed",
            InstrumentationEvent::QueryOpened { .. } => "query_opened",
            InstrumentationEvent::QueryNormalizedByDriver { .. } => "query_normalized_by_driver",
            InstrumentationEvent::ResultOpened { .. } => "result_opened",
            InstrumentationEvent::ResultClosed { .. } => "result_closed",
            InstrumentationEvent::QueryClosed { .. } => "query_closed",
            InstrumentationEvent::Warning { .. } => "warning",
            InstrumentationEvent::UsageAdvisorWarning { .. } => "usage_advisor_warning",
            InstrumentationEvent::Error { .. } => "error",
            InstrumentationEvent::DatabaseChanged { .. } => "database_changed",
            InstrumentationEvent::StatementPrepared { .. } => "statement_prepared",
            InstrumentationEvent::StatementExecuted { .. } => "statement_executed",
            InstrumentationEvent::StatementClosed { .. } => "statement_closed",
        }
    }
}

/// An event with the time it was observed, as stored in replay logs.
///
/// Lines without `at` are stamped when they are read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub event: InstrumentationEvent,
}

impl TimedEvent {
    /// Parse one JSONL line.
    pub fn from_json_line(line: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

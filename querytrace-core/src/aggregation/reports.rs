//! Report types kept per query shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::normalizer::QueryType;
use crate::types::CompletedQuery;

/// Rolling statistics for one normalized query against one server.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub text: String,
    pub query_type: QueryType,
    pub database: String,
    pub count: u64,
    pub rows: u64,
    pub min_rows: u64,
    pub max_rows: u64,
    pub bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub exec_time: Duration,
    pub min_exec_time: Duration,
    pub max_exec_time: Duration,
    pub warnings: u64,
    pub errors: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SummaryReport {
    /// An empty summary; the first [`apply`](Self::apply) seeds the minimums.
    pub fn new(text: impl Into<String>, query_type: QueryType, database: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            text: text.into(),
            query_type,
            database: database.into(),
            count: 0,
            rows: 0,
            min_rows: 0,
            max_rows: 0,
            bytes: 0,
            min_bytes: 0,
            max_bytes: 0,
            exec_time: Duration::ZERO,
            min_exec_time: Duration::ZERO,
            max_exec_time: Duration::ZERO,
            warnings: 0,
            errors: 0,
            no_index_used: 0,
            no_good_index_used: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn apply(&mut self, query: &CompletedQuery) {
        if self.count == 0 {
            self.min_rows = query.rows;
            self.min_bytes = query.bytes;
            self.min_exec_time = query.exec_time;
            self.first_seen = query.started_at;
            self.last_seen = query.started_at;
        } else {
            self.min_rows = self.min_rows.min(query.rows);
            self.min_bytes = self.min_bytes.min(query.bytes);
            self.min_exec_time = self.min_exec_time.min(query.exec_time);
            self.first_seen = self.first_seen.min(query.started_at);
            self.last_seen = self.last_seen.max(query.started_at);
        }
        self.max_rows = self.max_rows.max(query.rows);
        self.max_bytes = self.max_bytes.max(query.bytes);
        self.max_exec_time = self.max_exec_time.max(query.exec_time);

        self.count += 1;
        self.rows += query.rows;
        self.bytes += query.bytes;
        self.exec_time += query.exec_time;
        self.warnings += query.warnings;
        self.errors += query.errors;
        self.no_index_used += query.no_index_used;
        self.no_good_index_used += query.no_good_index_used;
    }

    pub fn avg_rows(&self) -> f64 {
        average(self.rows as f64, self.count)
    }

    pub fn avg_bytes(&self) -> f64 {
        average(self.bytes as f64, self.count)
    }

    pub fn avg_exec_time(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.exec_time / count,
            Err(_) => Duration::from_secs_f64(self.exec_time.as_secs_f64() / self.count as f64),
        }
    }
}

fn average(total: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// The single most expensive execution seen for a query shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WorstCaseReport {
    /// Server host the query ran against
    pub host_to: String,
    /// Host the application issued it from
    pub host_from: String,
    pub user: String,
    pub connection_id: u64,
    pub database: String,
    pub rows: u64,
    pub bytes: u64,
    pub exec_time: Duration,
    pub text: String,
    pub full_text: String,
    pub warnings: u64,
    pub errors: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
    pub occurred_at: DateTime<Utc>,
}

impl WorstCaseReport {
    pub fn from_query(query: &CompletedQuery) -> Self {
        Self {
            host_to: query.server.host.clone(),
            host_from: query.calling_host.clone(),
            user: query.server.user.clone(),
            connection_id: query.connection_id,
            database: query.server.database.clone(),
            rows: query.rows,
            bytes: query.bytes,
            exec_time: query.exec_time,
            text: query.text.clone(),
            full_text: query.full_text.clone(),
            warnings: query.warnings,
            errors: query.errors,
            no_index_used: query.no_index_used,
            no_good_index_used: query.no_good_index_used,
            occurred_at: query.started_at,
        }
    }

    /// Rows first, execution time breaks ties.
    pub fn is_exceeded_by(&self, query: &CompletedQuery) -> bool {
        (query.rows, query.exec_time) > (self.rows, self.exec_time)
    }
}

/// One row of `EXPLAIN` output. Every column is optional because servers
/// differ in what they return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_len: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Plan fetched once per query shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainReport {
    pub select_type: String,
    pub rows: Vec<ExplainRow>,
}

impl ExplainReport {
    /// Builds the report for a statement of `query_type`. Write statements
    /// report their verb as the select type.
    pub fn from_rows(query_type: QueryType, rows: Vec<ExplainRow>) -> Self {
        let select_type = if query_type.is_write() {
            query_type.as_str().to_string()
        } else {
            rows.first()
                .and_then(|row| row.select_type.clone())
                .unwrap_or_else(|| "SIMPLE".to_string())
        };
        Self { select_type, rows }
    }
}

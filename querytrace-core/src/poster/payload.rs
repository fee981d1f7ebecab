//! Export payload sent to the monitoring endpoint.
//!
//! Execution times are integer microseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::aggregation::{ExplainReport, QuerySnapshot, ServerAggregation, WorstCaseReport};
use crate::normalizer::QueryType;

/// One POST worth of reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    /// Random id of this engine instance
    pub agent_id: String,
    pub calling_host: String,
    pub generated_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub reports: Vec<QueryReport>,
}

/// Server a report belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub user: String,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Summary of one normalized query against one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReport {
    pub query_id: String,
    pub server: ServerInfo,
    pub text: String,
    pub database: String,
    pub query_type: QueryType,
    pub count: u64,
    pub rows: u64,
    pub min_rows: u64,
    pub max_rows: u64,
    pub avg_rows: f64,
    pub bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub avg_bytes: f64,
    pub exec_time: u64,
    pub min_exec_time: u64,
    pub max_exec_time: u64,
    pub avg_exec_time: u64,
    pub warnings: u64,
    pub errors: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_case: Option<WorstCasePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<ExplainReport>,
}

/// Worst-case execution as exported. The raw statement is left out: it
/// carries literal values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorstCasePayload {
    pub host_to: String,
    pub host_from: String,
    pub user: String,
    pub connection_id: u64,
    pub database: String,
    pub rows: u64,
    pub bytes: u64,
    pub exec_time: u64,
    pub text: String,
    pub warnings: u64,
    pub errors: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
    pub occurred_at: DateTime<Utc>,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl From<&WorstCaseReport> for WorstCasePayload {
    fn from(worst: &WorstCaseReport) -> Self {
        Self {
            host_to: worst.host_to.clone(),
            host_from: worst.host_from.clone(),
            user: worst.user.clone(),
            connection_id: worst.connection_id,
            database: worst.database.clone(),
            rows: worst.rows,
            bytes: worst.bytes,
            exec_time: micros(worst.exec_time),
            text: worst.text.clone(),
            warnings: worst.warnings,
            errors: worst.errors,
            no_index_used: worst.no_index_used,
            no_good_index_used: worst.no_good_index_used,
            occurred_at: worst.occurred_at,
        }
    }
}

impl QueryReport {
    pub fn from_snapshot(server: &ServerAggregation, snapshot: &QuerySnapshot) -> Self {
        let key = server.key();
        let summary = &snapshot.summary;
        Self {
            query_id: snapshot.query_id.clone(),
            server: ServerInfo {
                host: key.host.clone(),
                user: key.user.clone(),
                database: key.database.clone(),
                uuid: server.uuid(),
            },
            text: summary.text.clone(),
            database: summary.database.clone(),
            query_type: summary.query_type,
            count: summary.count,
            rows: summary.rows,
            min_rows: summary.min_rows,
            max_rows: summary.max_rows,
            avg_rows: summary.avg_rows(),
            bytes: summary.bytes,
            min_bytes: summary.min_bytes,
            max_bytes: summary.max_bytes,
            avg_bytes: summary.avg_bytes(),
            exec_time: micros(summary.exec_time),
            min_exec_time: micros(summary.min_exec_time),
            max_exec_time: micros(summary.max_exec_time),
            avg_exec_time: micros(summary.avg_exec_time()),
            warnings: summary.warnings,
            errors: summary.errors,
            no_index_used: summary.no_index_used,
            no_good_index_used: summary.no_good_index_used,
            first_seen: summary.first_seen,
            last_seen: summary.last_seen,
            worst_case: snapshot.worst_case.as_ref().map(WorstCasePayload::from),
            explain: snapshot.explain.clone(),
        }
    }
}

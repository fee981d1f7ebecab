//! Per query shape aggregation.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::reports::{ExplainReport, SummaryReport, WorstCaseReport};
use crate::normalizer::QueryType;
use crate::types::CompletedQuery;

/// Statistics for one normalized query against one server.
///
/// All mutable state sits behind one short-lived lock. Every change bumps
/// a revision; the poster records the revision it exported, so the
/// aggregation is dirty while `revision > posted_revision`.
pub struct QueryAggregation {
    query_id: String,
    text: String,
    query_type: QueryType,
    state: Mutex<AggregationState>,
}

struct AggregationState {
    summary: SummaryReport,
    worst_case: Option<WorstCaseReport>,
    explain: Option<ExplainReport>,
    revision: u64,
    posted_revision: u64,
}

/// Copy of an aggregation taken under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub query_id: String,
    pub revision: u64,
    pub summary: SummaryReport,
    pub worst_case: Option<WorstCaseReport>,
    pub explain: Option<ExplainReport>,
}

impl QueryAggregation {
    pub fn new(text: impl Into<String>, query_type: QueryType, database: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            query_id: query_id(&text),
            text: text.clone(),
            query_type,
            state: Mutex::new(AggregationState {
                summary: SummaryReport::new(text, query_type, database),
                worst_case: None,
                explain: None,
                revision: 0,
                posted_revision: 0,
            }),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    /// Fold one execution into the summary and, when it is the most
    /// expensive so far, the worst case.
    pub fn apply(&self, query: &CompletedQuery) {
        let mut state = self.state.lock();
        state.summary.apply(query);
        let replace = state
            .worst_case
            .as_ref()
            .map_or(true, |worst| worst.is_exceeded_by(query));
        if replace {
            state.worst_case = Some(WorstCaseReport::from_query(query));
        }
        state.revision += 1;
    }

    pub fn set_explain(&self, explain: ExplainReport) {
        let mut state = self.state.lock();
        state.explain = Some(explain);
        state.revision += 1;
    }

    pub fn summary(&self) -> SummaryReport {
        self.state.lock().summary.clone()
    }

    pub fn worst_case(&self) -> Option<WorstCaseReport> {
        self.state.lock().worst_case.clone()
    }

    pub fn explain(&self) -> Option<ExplainReport> {
        self.state.lock().explain.clone()
    }

    pub fn count(&self) -> u64 {
        self.state.lock().summary.count
    }

    pub fn snapshot(&self) -> QuerySnapshot {
        let state = self.state.lock();
        QuerySnapshot {
            query_id: self.query_id.clone(),
            revision: state.revision,
            summary: state.summary.clone(),
            worst_case: state.worst_case.clone(),
            explain: state.explain.clone(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.revision > state.posted_revision
    }

    /// Record a successful export. Changes made after the snapshot keep
    /// the aggregation dirty.
    pub fn mark_posted(&self, revision: u64) {
        let mut state = self.state.lock();
        state.posted_revision = state.posted_revision.max(revision);
    }
}

impl std::fmt::Debug for QueryAggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryAggregation")
            .field("query_id", &self.query_id)
            .field("text", &self.text)
            .field("count", &self.count())
            .finish()
    }
}

/// Stable id of a query shape: 32 hex chars of the sha256 of its text.
pub fn query_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..16])
}

//! Server inspection
//!
//! The engine occasionally needs to ask a database server something: its
//! inventory uuid, or the plan of a newly seen query. Those calls go through
//! the [`ServerInspector`] seam, implemented by whoever owns real
//! connections, and run on the runtime's blocking pool so the event path
//! never waits on them.

use std::sync::Arc;
use tokio::runtime::Handle;

use crate::aggregation::{ExplainReport, ExplainRow, QueryAggregation, ServerAggregation};
use crate::error::Result;
use crate::normalizer::QueryType;
use crate::types::ServerKey;

/// Single-row, single-column query returning the server's inventory uuid.
pub const UUID_LOOKUP_QUERY: &str = "SELECT value FROM mysql.inventory WHERE name = 'uuid'";

/// Blocking access to the servers being monitored.
pub trait ServerInspector: Send + Sync + 'static {
    /// Run `sql` and return the first column of the first row.
    fn scalar(&self, server: &ServerKey, sql: &str) -> Result<Option<String>>;

    /// Run an `EXPLAIN` statement and return its rows.
    fn explain(&self, server: &ServerKey, sql: &str) -> Result<Vec<ExplainRow>>;
}

/// Inspector for environments without server access. Lookups come back
/// empty, so uuids and plans stay unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInspector;

impl ServerInspector for NullInspector {
    fn scalar(&self, _server: &ServerKey, _sql: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn explain(&self, _server: &ServerKey, _sql: &str) -> Result<Vec<ExplainRow>> {
        Ok(Vec::new())
    }
}

/// Statement kinds that get a plan.
pub fn is_explainable(query_type: QueryType) -> bool {
    matches!(
        query_type,
        QueryType::Select
            | QueryType::Insert
            | QueryType::Update
            | QueryType::Delete
            | QueryType::Replace
    )
}

/// Schedules inspector calls on a runtime's blocking pool and applies the
/// answers to the aggregations. Failures are logged and never retried.
#[derive(Clone)]
pub struct Resolver {
    inspector: Arc<dyn ServerInspector>,
    handle: Handle,
    explain: bool,
}

impl Resolver {
    pub fn new(inspector: Arc<dyn ServerInspector>, handle: Handle, explain: bool) -> Self {
        Self {
            inspector,
            handle,
            explain,
        }
    }

    pub fn resolve_uuid(&self, server: &Arc<ServerAggregation>) {
        let server = Arc::clone(server);
        let inspector = Arc::clone(&self.inspector);
        self.handle.spawn_blocking(move || {
            match inspector.scalar(server.key(), UUID_LOOKUP_QUERY) {
                Ok(Some(uuid)) if !uuid.is_empty() => {
                    tracing::debug!(server = %server.key(), uuid = %uuid, "Resolved server uuid");
                    server.set_uuid(uuid);
                }
                Ok(_) => {
                    tracing::debug!(server = %server.key(), "Server returned no uuid");
                }
                Err(e) => {
                    tracing::warn!(server = %server.key(), error = %e, "Failed to resolve server uuid");
                }
            }
        });
    }

    /// Fetch the plan of `sql` for a query shape seen for the first time.
    pub fn explain(&self, server: &ServerKey, query: &Arc<QueryAggregation>, sql: &str) {
        let query_type = query.query_type();
        if !self.explain || !is_explainable(query_type) {
            return;
        }

        let server = server.clone();
        let query = Arc::clone(query);
        let statement = format!("EXPLAIN {}", sql);
        let inspector = Arc::clone(&self.inspector);
        self.handle.spawn_blocking(move || match inspector.explain(&server, &statement) {
            Ok(rows) if rows.is_empty() => {
                tracing::debug!(server = %server, query_id = %query.query_id(), "EXPLAIN returned no rows");
            }
            Ok(rows) => {
                query.set_explain(ExplainReport::from_rows(query_type, rows));
            }
            Err(e) => {
                tracing::warn!(
                    server = %server,
                    query_id = %query.query_id(),
                    error = %e,
                    "EXPLAIN failed"
                );
            }
        });
    }
}

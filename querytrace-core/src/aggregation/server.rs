//! Server-level aggregation and the directory of known servers.

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::query::QueryAggregation;
use crate::inspector::Resolver;
use crate::types::{CompletedQuery, ServerKey};

/// Everything aggregated against one server target.
///
/// Queries are kept in first-seen order.
pub struct ServerAggregation {
    key: ServerKey,
    uuid: RwLock<Option<String>>,
    queries: RwLock<IndexMap<String, Arc<QueryAggregation>>>,
    cache_age_secs: u64,
    /// Seconds until the next export of this server is due
    post_countdown: Mutex<i64>,
}

impl ServerAggregation {
    pub fn new(key: ServerKey, cache_age_secs: u64) -> Self {
        Self {
            key,
            uuid: RwLock::new(None),
            queries: RwLock::new(IndexMap::new()),
            cache_age_secs,
            post_countdown: Mutex::new(cache_age_secs as i64),
        }
    }

    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Server uuid, once the lookup has come back.
    pub fn uuid(&self) -> Option<String> {
        self.uuid.read().clone()
    }

    pub fn set_uuid(&self, uuid: impl Into<String>) {
        *self.uuid.write() = Some(uuid.into());
    }

    /// Fold a completed query in. Returns the aggregation and whether it
    /// was created by this call.
    pub fn record(&self, query: &CompletedQuery) -> (Arc<QueryAggregation>, bool) {
        let existing = self.queries.read().get(&query.text).cloned();
        let (aggregation, created) = match existing {
            Some(aggregation) => (aggregation, false),
            None => {
                let mut queries = self.queries.write();
                // another worker may have inserted it between the locks
                let created = !queries.contains_key(&query.text);
                let aggregation = queries
                    .entry(query.text.clone())
                    .or_insert_with(|| {
                        Arc::new(QueryAggregation::new(
                            &query.text,
                            query.query_type,
                            &query.server.database,
                        ))
                    })
                    .clone();
                (aggregation, created)
            }
        };
        aggregation.apply(query);
        (aggregation, created)
    }

    pub fn query_count(&self) -> usize {
        self.queries.read().len()
    }

    /// Aggregation by first-seen position.
    pub fn query(&self, index: usize) -> Option<Arc<QueryAggregation>> {
        self.queries
            .read()
            .get_index(index)
            .map(|(_, aggregation)| Arc::clone(aggregation))
    }

    pub fn find_query(&self, text: &str) -> Option<Arc<QueryAggregation>> {
        self.queries.read().get(text).cloned()
    }

    pub fn queries(&self) -> Vec<Arc<QueryAggregation>> {
        self.queries.read().values().cloned().collect()
    }

    /// Advance the export countdown by `elapsed_secs`. Returns true when
    /// an export is due. The countdown stays due until
    /// [`reset_post_countdown`](Self::reset_post_countdown).
    pub fn advance_post_countdown(&self, elapsed_secs: u64) -> bool {
        let mut countdown = self.post_countdown.lock();
        *countdown = countdown.saturating_sub(elapsed_secs as i64).max(0);
        *countdown == 0
    }

    pub fn reset_post_countdown(&self) {
        *self.post_countdown.lock() = self.cache_age_secs as i64;
    }
}

impl std::fmt::Debug for ServerAggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAggregation")
            .field("key", &self.key)
            .field("uuid", &self.uuid())
            .field("queries", &self.query_count())
            .finish()
    }
}

/// Maps server identities to their aggregations, creating them on demand.
pub struct ServerDirectory {
    servers: RwLock<IndexMap<ServerKey, Arc<ServerAggregation>>>,
    resolver: Resolver,
    cache_age_secs: u64,
}

impl ServerDirectory {
    pub fn new(resolver: Resolver, cache_age_secs: u64) -> Self {
        Self {
            servers: RwLock::new(IndexMap::new()),
            resolver,
            cache_age_secs,
        }
    }

    /// Existing aggregation for `key`, or a new one with its uuid lookup
    /// scheduled. The lookup is issued once per key.
    pub fn resolve(&self, key: &ServerKey) -> Arc<ServerAggregation> {
        if let Some(server) = self.servers.read().get(key) {
            return Arc::clone(server);
        }

        let mut servers = self.servers.write();
        if let Some(server) = servers.get(key) {
            return Arc::clone(server);
        }
        let server = Arc::new(ServerAggregation::new(key.clone(), self.cache_age_secs));
        servers.insert(key.clone(), Arc::clone(&server));
        drop(servers);

        tracing::info!(server = %key, "Tracking new server");
        self.resolver.resolve_uuid(&server);
        server
    }

    /// Route a completed query to its server and query aggregation. The
    /// first execution of a query shape schedules its EXPLAIN.
    pub fn record(&self, query: &CompletedQuery) {
        let server = self.resolve(&query.server);
        let (aggregation, created) = server.record(query);
        if created {
            tracing::debug!(
                server = %query.server,
                query_id = %aggregation.query_id(),
                text = %query.text,
                "New query shape"
            );
            self.resolver.explain(&query.server, &aggregation, &query.full_text);
        }
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Server by first-seen position.
    pub fn get(&self, index: usize) -> Option<Arc<ServerAggregation>> {
        self.servers
            .read()
            .get_index(index)
            .map(|(_, server)| Arc::clone(server))
    }

    pub fn find(&self, key: &ServerKey) -> Option<Arc<ServerAggregation>> {
        self.servers.read().get(key).cloned()
    }

    pub fn servers(&self) -> Vec<Arc<ServerAggregation>> {
        self.servers.read().values().cloned().collect()
    }
}

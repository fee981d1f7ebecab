//! Core domain types for querytrace
//!
//! Shared between the in-process tracker, which produces [`CompletedQuery`]
//! records, and the aggregation model, which folds them into reports keyed
//! by [`ServerKey`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::normalizer::QueryType;

/// Identity of a logical server target, before its uuid is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub host: String,
    pub user: String,
    pub database: String,
}

impl ServerKey {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.user, self.host, self.database)
    }
}

/// Connection parameters parsed from a driver connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConnection {
    pub host: String,
    pub user: String,
    pub database: String,
    /// Server thread id reported when the connection was opened
    pub thread_id: Option<u32>,
}

impl DriverConnection {
    /// Parse a `key=value;key=value` connection string.
    ///
    /// Keys are case-insensitive and accept the common aliases. Unknown
    /// keys (passwords, pooling options) are ignored. A missing host
    /// means `localhost`.
    pub fn parse(connection_string: &str, thread_id: Option<u32>) -> Self {
        let mut host = None;
        let mut user = None;
        let mut database = None;

        for part in connection_string.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "server" | "host" | "data source" | "datasource" | "address" | "addr"
                | "network address" => host = Some(value),
                "uid" | "user id" | "userid" | "user" | "username" | "user name" => {
                    user = Some(value)
                }
                "database" | "initial catalog" => database = Some(value),
                _ => {}
            }
        }

        Self {
            host: host
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            user: user.unwrap_or_default(),
            database: database.unwrap_or_default(),
            thread_id,
        }
    }

    pub fn server_key(&self) -> ServerKey {
        ServerKey::new(&self.host, &self.user, &self.database)
    }
}

/// A finished query, handed from the tracker to the aggregation worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedQuery {
    pub connection_id: u64,
    pub thread_id: Option<u32>,
    /// Server and database the query ran against, captured when it opened
    pub server: ServerKey,
    /// Normalized text (or the driver's own normalization)
    pub text: String,
    /// Statement as issued, used for EXPLAIN
    pub full_text: String,
    pub query_type: QueryType,
    pub rows: u64,
    pub skipped_rows: u64,
    pub bytes: u64,
    pub warnings: u64,
    pub errors: u64,
    pub no_index_used: u64,
    pub no_good_index_used: u64,
    pub result_count: u32,
    /// Open to first result, or to close when no result was produced
    pub exec_time: Duration,
    pub started_at: DateTime<Utc>,
    /// Host the instrumented application runs on
    pub calling_host: String,
}

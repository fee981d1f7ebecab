//! At-rest aggregation model
//!
//! ```text
//! ServerDirectory ─┬─ ServerAggregation (host, user, database, uuid)
//!                  │    └─ QueryAggregation (normalized text)
//!                  │         ├─ SummaryReport
//!                  │         ├─ WorstCaseReport
//!                  │         └─ ExplainReport (optional)
//!                  └─ ...
//! ```
//!
//! Servers and queries are kept for the lifetime of the process, in
//! first-seen order. Each level has its own lock; no lock is held while
//! another level's lock is taken, except the directory handing out `Arc`s.

mod query;
mod reports;
mod server;

pub use query::{query_id, QueryAggregation, QuerySnapshot};
pub use reports::{ExplainReport, ExplainRow, SummaryReport, WorstCaseReport};
pub use server::{ServerAggregation, ServerDirectory};

//! Periodic export of aggregated reports
//!
//! ## Architecture
//!
//! The poster runs on its own task and never touches the event path:
//!
//! ```text
//! Idle ──tick──▶ Collecting ──▶ Sending ──▶ Idle
//! ```
//!
//! - **Collecting**: every server whose cache-age countdown has run out
//!   contributes a snapshot of each dirty query aggregation, each taken
//!   under that aggregation's own lock.
//! - **Sending**: one [`ReportBatch`] goes through the [`ReportSink`]. No
//!   aggregation lock is held here.
//! - On success the snapshots' revisions are marked posted and the servers'
//!   countdowns restart. On failure nothing is marked, so the next tick
//!   sends the same data again.
//!
//! ## Usage
//!
//! Enable posting in `~/.config/querytrace/config.toml`:
//!
//! ```toml
//! [poster]
//! enabled = true
//! server_url = "https://monitor.example.com:18443"
//! user = "agent"
//! password = "secret"
//! post_interval_secs = 60
//! ```

mod client;
mod payload;

pub use client::{PostResponse, ReportClient};
pub use payload::{QueryReport, ReportBatch, ServerInfo, WorstCasePayload};

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregation::{QueryAggregation, ServerAggregation, ServerDirectory};
use crate::error::Result;

/// Destination of report batches.
pub trait ReportSink: Send + Sync + 'static {
    fn send(&self, batch: &ReportBatch) -> impl Future<Output = Result<PostResponse>> + Send;
}

impl ReportSink for ReportClient {
    async fn send(&self, batch: &ReportBatch) -> Result<PostResponse> {
        self.post_reports(batch).await
    }
}

impl<S: ReportSink> ReportSink for Arc<S> {
    fn send(&self, batch: &ReportBatch) -> impl Future<Output = Result<PostResponse>> + Send {
        (**self).send(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosterState {
    Idle,
    Collecting,
    Sending,
}

/// Posting statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostStats {
    /// Reports accepted by the sink
    pub reports_sent: usize,
    /// Batches delivered
    pub batches_sent: usize,
    /// Batches that failed and will be retried
    pub failures: usize,
}

/// Snapshot every query aggregation of the directory as a report. With
/// `include_clean` false only aggregations changed since their last
/// export are returned.
pub fn collect_reports(directory: &ServerDirectory, include_clean: bool) -> Vec<QueryReport> {
    directory
        .servers()
        .iter()
        .flat_map(|server| {
            server
                .queries()
                .into_iter()
                .filter(|query| include_clean || query.is_dirty())
                .map(|query| QueryReport::from_snapshot(server, &query.snapshot()))
                .collect::<Vec<_>>()
        })
        .collect()
}

struct Collected {
    servers: Vec<Arc<ServerAggregation>>,
    posted: Vec<(Arc<QueryAggregation>, u64)>,
    reports: Vec<QueryReport>,
}

/// Sends dirty aggregations to a [`ReportSink`] on a fixed interval.
pub struct Poster<S> {
    sink: S,
    directory: Arc<ServerDirectory>,
    agent_id: String,
    calling_host: String,
    interval: Duration,
    state: PosterState,
    stats: PostStats,
}

impl<S: ReportSink> Poster<S> {
    pub fn new(
        sink: S,
        directory: Arc<ServerDirectory>,
        interval: Duration,
        calling_host: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            directory,
            agent_id: uuid::Uuid::new_v4().to_string(),
            calling_host: calling_host.into(),
            interval,
            state: PosterState::Idle,
            stats: PostStats::default(),
        }
    }

    pub fn state(&self) -> PosterState {
        self.state
    }

    pub fn stats(&self) -> PostStats {
        self.stats
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// One posting cycle. Returns the number of reports accepted.
    pub async fn tick(&mut self) -> Result<usize> {
        self.cycle(false).await
    }

    /// Send every dirty aggregation regardless of cache age.
    pub async fn flush(&mut self) -> Result<usize> {
        self.cycle(true).await
    }

    async fn cycle(&mut self, force: bool) -> Result<usize> {
        self.state = PosterState::Collecting;
        let collected = self.collect(force);

        if collected.reports.is_empty() {
            collected.servers.iter().for_each(|s| s.reset_post_countdown());
            self.state = PosterState::Idle;
            return Ok(0);
        }

        let batch = ReportBatch {
            agent_id: self.agent_id.clone(),
            calling_host: self.calling_host.clone(),
            generated_at: Utc::now(),
            interval_secs: self.interval.as_secs(),
            reports: collected.reports,
        };

        self.state = PosterState::Sending;
        let result = self.sink.send(&batch).await;
        self.state = PosterState::Idle;

        match result {
            Ok(response) => {
                for (query, revision) in &collected.posted {
                    query.mark_posted(*revision);
                }
                collected.servers.iter().for_each(|s| s.reset_post_countdown());
                self.stats.batches_sent += 1;
                self.stats.reports_sent += response.accepted;
                tracing::debug!(
                    reports = batch.reports.len(),
                    accepted = response.accepted,
                    rejected = response.rejected,
                    "Posted query reports"
                );
                Ok(response.accepted)
            }
            Err(e) => {
                self.stats.failures += 1;
                tracing::warn!(
                    reports = batch.reports.len(),
                    error = %e,
                    "Failed to post query reports, retrying next interval"
                );
                Err(e)
            }
        }
    }

    fn collect(&self, force: bool) -> Collected {
        let elapsed = self.interval.as_secs();
        let mut collected = Collected {
            servers: Vec::new(),
            posted: Vec::new(),
            reports: Vec::new(),
        };

        for server in self.directory.servers() {
            let due = server.advance_post_countdown(elapsed);
            if !(due || force) {
                continue;
            }
            for query in server.queries() {
                if !query.is_dirty() {
                    continue;
                }
                let snapshot = query.snapshot();
                collected
                    .reports
                    .push(QueryReport::from_snapshot(&server, &snapshot));
                collected.posted.push((query, snapshot.revision));
            }
            collected.servers.push(server);
        }
        collected
    }

    /// Tick on a fixed interval until `shutdown` flips to true, then flush
    /// once more and return the totals.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PostStats {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            agent_id = %self.agent_id,
            "Poster started"
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are logged and retried on the next tick
                    let _ = self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "Final report flush failed");
        }
        tracing::info!(
            batches = self.stats.batches_sent,
            reports = self.stats.reports_sent,
            failures = self.stats.failures,
            "Poster stopped"
        );
        self.stats
    }
}

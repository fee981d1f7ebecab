//! Engine assembly and lifecycle
//!
//! [`Engine`] owns a multi-thread tokio runtime and everything that runs
//! on it: the aggregation worker, background uuid/EXPLAIN lookups and,
//! when configured, the poster. Events are dispatched synchronously on the
//! caller's thread.
//!
//! Shutdown order matters: the dispatcher is closed first, the worker
//! drains every completed query, and only then does the poster run its
//! final flush, so the last interval's data is exported.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregation::ServerDirectory;
use crate::config::Config;
use crate::dispatcher::{aggregate_completions, DispatchStats, EventDispatcher};
use crate::error::{Error, Result};
use crate::events::InstrumentationEvent;
use crate::inspector::{Resolver, ServerInspector};
use crate::normalizer::{KeywordTable, QueryNormalizer};
use crate::poster::{PostStats, Poster, ReportClient, ReportSink};
use crate::tracker::InProcessQueryTable;

/// How long shutdown waits for background lookups still running.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Totals returned by [`Engine::shutdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub dispatch: DispatchStats,
    /// Completed queries folded into the directory
    pub recorded: u64,
    pub post: PostStats,
}

pub struct Engine {
    runtime: Option<Runtime>,
    dispatcher: Arc<EventDispatcher>,
    directory: Arc<ServerDirectory>,
    worker: Option<JoinHandle<u64>>,
    poster: Option<(watch::Sender<bool>, JoinHandle<PostStats>)>,
}

impl Engine {
    /// Start an engine. Reports are posted to the configured endpoint when
    /// `[poster]` is enabled and complete.
    pub fn start(config: &Config, inspector: Arc<dyn ServerInspector>) -> Result<Self> {
        let client = if config.poster.is_ready() {
            Some(ReportClient::new(&config.poster)?)
        } else {
            tracing::info!("Poster disabled, aggregating in memory only");
            None
        };
        Self::build(config, inspector, client)
    }

    /// Start an engine that posts through `sink`, whatever `[poster]` says.
    pub fn start_with_sink<S: ReportSink>(
        config: &Config,
        inspector: Arc<dyn ServerInspector>,
        sink: S,
    ) -> Result<Self> {
        Self::build(config, inspector, Some(sink))
    }

    fn build<S: ReportSink>(
        config: &Config,
        inspector: Arc<dyn ServerInspector>,
        sink: Option<S>,
    ) -> Result<Self> {
        if sink.is_some() {
            config.poster.validate_timing()?;
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.engine.worker_threads.max(1))
            .thread_name("querytrace-worker")
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("failed to create runtime: {}", e)))?;

        let calling_host = config.engine.calling_host();
        let resolver = Resolver::new(inspector, runtime.handle().clone(), config.engine.explain);
        let directory = Arc::new(ServerDirectory::new(resolver, config.poster.cache_age()));

        let normalizer = QueryNormalizer::new(Arc::new(KeywordTable::mysql()));
        let table = InProcessQueryTable::new(normalizer, calling_host.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(EventDispatcher::new(table, tx));

        let worker = runtime.spawn(aggregate_completions(rx, Arc::clone(&directory)));

        let poster = sink.map(|sink| {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let poster = Poster::new(
                sink,
                Arc::clone(&directory),
                config.poster.post_interval(),
                calling_host.clone(),
            );
            (shutdown_tx, runtime.spawn(poster.run(shutdown_rx)))
        });

        tracing::info!(
            worker_threads = config.engine.worker_threads,
            explain = config.engine.explain,
            posting = poster.is_some(),
            calling_host = %calling_host,
            "Engine started"
        );

        Ok(Self {
            runtime: Some(runtime),
            dispatcher,
            directory,
            worker: Some(worker),
            poster,
        })
    }

    /// Feed one instrumentation event. Never blocks on I/O.
    pub fn dispatch(&self, event: InstrumentationEvent) {
        self.dispatcher.dispatch(event);
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.directory
    }

    /// Queries currently open across all connections.
    pub fn in_process_count(&self) -> usize {
        self.dispatcher.table().len()
    }

    /// Stop accepting completions, drain the worker, flush the poster and
    /// stop the runtime.
    pub fn shutdown(mut self) -> Result<EngineStats> {
        self.dispatcher.close();
        let runtime = self
            .runtime
            .take()
            .ok_or_else(|| Error::Runtime("engine already stopped".to_string()))?;

        let recorded = match self.worker.take() {
            Some(worker) => runtime
                .block_on(worker)
                .map_err(|e| Error::Runtime(format!("aggregation worker failed: {}", e)))?,
            None => 0,
        };

        let post = match self.poster.take() {
            Some((shutdown, handle)) => {
                let _ = shutdown.send(true);
                runtime
                    .block_on(handle)
                    .map_err(|e| Error::Runtime(format!("poster failed: {}", e)))?
            }
            None => PostStats::default(),
        };

        runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

        let stats = EngineStats {
            dispatch: self.dispatcher.stats(),
            recorded,
            post,
        };
        tracing::info!(
            events = stats.dispatch.events,
            recorded = stats.recorded,
            reports_sent = stats.post.reports_sent,
            "Engine stopped"
        );
        Ok(stats)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.dispatcher.close();
            runtime.shutdown_background();
        }
    }
}

//! # querytrace-core
//!
//! Core library for querytrace - an aggregation engine for database query
//! telemetry.
//!
//! This library provides:
//! - SQL normalization into stable grouping keys
//! - Tracking of in-flight queries from driver instrumentation events
//! - Per-server, per-query rolling statistics
//! - Periodic export of changed statistics to a monitoring endpoint
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! events ─▶ EventDispatcher ─▶ InProcessQueryTable
//!                                   │ query closed
//!                                   ▼
//!                        aggregation worker ─▶ ServerDirectory ─▶ Poster
//! ```
//!
//! The dispatcher runs on the instrumented application's threads and never
//! waits on I/O. Aggregation, server inspection and posting run on the
//! engine's own runtime.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use querytrace_core::{Config, Engine, InstrumentationEvent, NullInspector};
//!
//! let config = Config::load().expect("failed to load config");
//! let engine = Engine::start(&config, Arc::new(NullInspector)).expect("failed to start engine");
//!
//! engine.dispatch(InstrumentationEvent::ConnectionOpened {
//!     connection_id: 1,
//!     thread_id: Some(10),
//!     connection_string: "server=db1;uid=app;database=shop".to_string(),
//! });
//!
//! let stats = engine.shutdown().expect("failed to stop engine");
//! println!("{} queries recorded", stats.recorded);
//! ```

// Re-export commonly used items at the crate root
pub use aggregation::{QueryAggregation, ServerAggregation, ServerDirectory};
pub use config::Config;
pub use dispatcher::EventDispatcher;
pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
pub use events::{InstrumentationEvent, TimedEvent, UsageAdvisorFlag};
pub use inspector::{NullInspector, ServerInspector};
pub use normalizer::{QueryNormalizer, QueryType};
pub use poster::{PostStats, ReportSink};
pub use types::*;

// Public modules
pub mod aggregation;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod inspector;
pub mod logging;
pub mod normalizer;
pub mod poster;
pub mod tracker;
pub mod types;

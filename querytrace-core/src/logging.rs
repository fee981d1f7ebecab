//! File logging for the engine and the CLI.
//!
//! Event handlers run on the instrumented application's threads, so records
//! go through a non-blocking writer into a daily-rotated file under
//! `$XDG_STATE_HOME/querytrace/`. The configured level applies to the
//! querytrace targets only; HTTP and runtime crates stay at `warn` unless
//! `RUST_LOG` says otherwise.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "querytrace.log";

/// Targets that follow `logging.level`.
const ENGINE_TARGETS: &[&str] = &["querytrace_core", "querytrace"];

/// Install the global file logger in the XDG state directory.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    init_in(&Config::state_dir(), config)
}

/// Install the global file logger writing into `log_dir`.
///
/// Fails if the level is not a tracing level or a global subscriber is
/// already installed.
pub fn init_in(log_dir: &Path, config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(engine_directives(&config.level)?)
            .map_err(|e| Error::Config(format!("invalid logging filter: {}", e)))?,
    };

    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// `warn` for everything, `level` for the querytrace targets.
fn engine_directives(level: &str) -> Result<String> {
    let level: LevelFilter = level
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("logging.level '{}' is not a log level", level)))?;

    let mut directives = vec![LevelFilter::WARN.to_string()];
    directives.extend(ENGINE_TARGETS.iter().map(|target| format!("{}={}", target, level)));
    Ok(directives.join(","))
}

/// Test subscriber printing through the test harness, filtered by `RUST_LOG`.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes buffered records when dropped; hold it until the process exits.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_applies_to_engine_targets() {
        assert_eq!(
            engine_directives("debug").unwrap(),
            "warn,querytrace_core=debug,querytrace=debug"
        );
        assert_eq!(
            engine_directives(" TRACE ").unwrap(),
            "warn,querytrace_core=trace,querytrace=trace"
        );
    }

    #[test]
    fn test_unknown_level_is_a_config_error() {
        let err = engine_directives("loud").unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("'loud'")));
    }

    #[test]
    fn test_init_writes_rotated_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig::default();

        let guard = init_in(dir.path(), &config).unwrap();
        tracing::warn!(target: "querytrace_core::engine", "flush check");
        assert!(init_in(dir.path(), &config).is_err());
        drop(guard);

        let contents: String = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(LOG_FILE_PREFIX)
            })
            .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
            .collect();
        assert!(contents.contains("flush check"), "log was: {contents}");
    }
}

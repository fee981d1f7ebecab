//! querytrace - inspect and exercise the query aggregation engine
//!
//! This tool provides commands for:
//! - Checking poster configuration and endpoint reachability
//! - Normalizing SQL the way the engine groups it
//! - Replaying recorded instrumentation events and printing the resulting
//!   aggregations
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/querytrace/config.toml (~/.config/querytrace/config.toml)
//! - Logs: $XDG_STATE_HOME/querytrace/querytrace.log (~/.local/state/querytrace/)

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use querytrace_core::normalizer::KeywordTable;
use querytrace_core::poster::{collect_reports, QueryReport, ReportClient};
use querytrace_core::{Config, Engine, NullInspector, QueryNormalizer, TimedEvent};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "querytrace")]
#[command(about = "Aggregate database query telemetry")]
#[command(version)]
struct Args {
    /// Write a log file under the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/querytrace/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show poster configuration and check the endpoint
    Status,

    /// Print the normalized form and type of SQL statements
    Normalize {
        /// Statement to normalize (reads one statement per line from stdin when omitted)
        sql: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Feed a JSONL file of instrumentation events through the engine
    Replay {
        /// Events file, one event object per line
        file: PathBuf,

        /// Print the aggregated reports as JSON
        #[arg(long)]
        json: bool,

        /// Post reports to the configured endpoint while replaying
        #[arg(long)]
        post: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;

    let _log_guard = if args.verbose {
        Some(querytrace_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config, args.config.as_deref()),
        Command::Normalize { sql, json } => cmd_normalize(sql, json),
        Command::Replay { file, json, post } => cmd_replay(config, &file, json, post),
    }
}

fn cmd_status(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::config_path);

    println!("querytrace Configuration");
    println!("========================");
    println!();
    println!(
        "Config File:     {}{}",
        path.display(),
        if path.exists() { "" } else { " (not found, using defaults)" }
    );
    println!("Log File:        {}", Config::log_path().display());
    println!("Worker Threads:  {}", config.engine.worker_threads);
    println!("Explain:         {}", config.engine.explain);
    println!("Calling Host:    {}", config.engine.calling_host());
    println!();

    let poster = &config.poster;
    println!("Poster Enabled:  {}", poster.enabled);

    if !poster.enabled {
        println!();
        println!("Posting is disabled. Enable it in config.toml:");
        println!();
        println!("  [poster]");
        println!("  enabled = true");
        println!("  server_url = \"https://monitor.example.com:18443\"");
        println!("  user = \"agent\"");
        println!("  password = \"secret\"");
        return Ok(());
    }

    println!(
        "Server URL:      {}",
        poster.server_url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "User:            {}",
        poster.user.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Password:        {}",
        if poster.password.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Post Interval:   {}s", poster.post_interval_secs);
    println!("Cache Age:       {}s", poster.cache_age());
    println!("Timeout:         {}s", poster.timeout_secs);

    println!();
    if !poster.is_ready() {
        println!("Status: Not ready (missing required configuration)");
        return Ok(());
    }

    let client = ReportClient::new(poster).context("failed to create report client")?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;
    let reachable = runtime.block_on(client.health_check())?;

    if reachable {
        println!("Status: Ready to post (endpoint reachable)");
    } else {
        println!("Status: Endpoint unreachable at {}", client.base_url());
    }
    Ok(())
}

fn cmd_normalize(sql: Option<String>, json: bool) -> Result<()> {
    let normalizer = QueryNormalizer::new(Arc::new(KeywordTable::mysql()));

    let statements = match sql {
        Some(sql) => vec![sql],
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("failed to read stdin")?;
            input
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()
        }
    };

    for statement in statements {
        let normalized = normalizer.normalize(&statement);
        if json {
            let value = serde_json::json!({
                "text": normalized.text,
                "query_type": normalized.query_type,
            });
            println!("{}", serde_json::to_string(&value)?);
        } else {
            let query_type = match normalized.query_type.as_str() {
                "" => "OTHER",
                other => other,
            };
            println!("{:<8} {}", query_type, normalized.text);
        }
    }
    Ok(())
}

fn cmd_replay(mut config: Config, file: &Path, json: bool, post: bool) -> Result<()> {
    if post && !config.poster.is_ready() {
        bail!("--post requires an enabled and complete [poster] configuration (run 'status')");
    }
    if !post {
        config.poster.enabled = false;
    }

    let reader = BufReader::new(
        std::fs::File::open(file)
            .with_context(|| format!("failed to open events file {}", file.display()))?,
    );

    let engine =
        Engine::start(&config, Arc::new(NullInspector)).context("failed to start engine")?;
    let directory = Arc::clone(engine.directory());
    let dispatcher = Arc::clone(engine.dispatcher());

    let mut skipped = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", file.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match TimedEvent::from_json_line(&line) {
            Ok(timed) => dispatcher.dispatch_at(timed.event, timed.at.unwrap_or_else(Utc::now)),
            Err(e) => {
                skipped += 1;
                tracing::warn!(line = index + 1, error = %e, "Skipping invalid event");
                eprintln!("line {}: {}", index + 1, e);
            }
        }
    }

    let still_open = engine.in_process_count();
    let stats = engine.shutdown().context("failed to stop engine")?;
    let reports = collect_reports(&directory, true);

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("Replayed {} event(s)", stats.dispatch.events);
    println!("Completed Queries: {}", stats.recorded);
    if still_open > 0 {
        println!("Still Open:        {}", still_open);
    }
    if skipped > 0 {
        println!("Invalid Lines:     {}", skipped);
    }
    if post {
        println!(
            "Posted:            {} report(s) in {} batch(es), {} failure(s)",
            stats.post.reports_sent, stats.post.batches_sent, stats.post.failures
        );
    }
    println!();
    print_reports(&reports);
    Ok(())
}

fn print_reports(reports: &[QueryReport]) {
    if reports.is_empty() {
        println!("No queries aggregated.");
        return;
    }

    println!(
        "{:<28} {:>6} {:>8} {:>10}  {}",
        "Server", "Count", "Rows", "Avg (ms)", "Query"
    );
    println!("{:-<90}", "");

    for report in reports {
        let server = format!(
            "{}@{}/{}",
            report.server.user, report.server.host, report.server.database
        );
        println!(
            "{:<28} {:>6} {:>8} {:>10.3}  {}",
            truncate(&server, 26),
            report.count,
            report.rows,
            report.avg_exec_time as f64 / 1000.0,
            truncate(&report.text, 60)
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        s.to_string()
    }
}

//! CLI commands implementation.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::checkpoint::SqliteCheckpointSink;
use crate::config::AppConfig;
use crate::dispatch::{DispatchConfig, RequestDispatcher};
use crate::engine::{ChunkOrchestrator, PaginationEngine};
use crate::models::{ChunkRunReport, CrawlRequest, CrawlTarget, Terminal};
use crate::observer::LogObserver;
use crate::pools::{ProxyPool, SessionPool};
use crate::rate_limit::{AdaptiveLimiter, AdmissionControl};

#[derive(Parser)]
#[command(name = "feedquarry")]
#[command(about = "Resilient feed and search crawler")]
#[command(version)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, env = "FEEDQUARRY_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a target's feed or a search query
    Crawl {
        /// Target: u/name, @name, a profile URL, or a raw search query
        target: String,
        /// Maximum items to collect
        #[arg(short, long, default_value = "800")]
        limit: usize,
        /// Start of historical range (YYYY-MM-DD); with --until, crawls
        /// month by month
        #[arg(long)]
        since: Option<String>,
        /// End of historical range (YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,
        /// Stop as soon as this item id is seen
        #[arg(long)]
        stop_at_id: Option<String>,
        /// Stop at items on or before this date (YYYY-MM-DD)
        #[arg(long)]
        stop_at_time: Option<String>,
        /// Never rotate away from the first session
        #[arg(long)]
        no_rotation: bool,
        /// Use direct egress even when proxies are configured
        #[arg(long)]
        no_proxy: bool,
        /// Write collected items as JSON lines to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List session pool health
    Sessions,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl {
            target,
            limit,
            since,
            until,
            stop_at_id,
            stop_at_time,
            no_rotation,
            no_proxy,
            output,
        } => {
            let target = CrawlTarget::parse(&target)?;
            let mut request = CrawlRequest::new(target, limit);
            request.since = since.as_deref().map(parse_date).transpose()?;
            request.until = until.as_deref().map(parse_date).transpose()?;
            request.stop_at_id = stop_at_id;
            request.stop_at_time = stop_at_time.as_deref().map(parse_date).transpose()?;
            request.rotation_enabled = !no_rotation;
            request.proxy_enabled = !no_proxy;

            crawl(&config, &request, output.as_deref()).await
        }
        Commands::Sessions => sessions(&config).await,
    }
}

async fn crawl(
    config: &AppConfig,
    request: &CrawlRequest,
    output: Option<&str>,
) -> anyhow::Result<()> {
    let sessions = Arc::new(SessionPool::new(config.pools.clone()));
    let loaded = sessions.load_all(&config.credentials_dir()).await?;
    if loaded == 0 {
        anyhow::bail!(
            "no session credentials in {}",
            config.credentials_dir().display()
        );
    }

    let proxies = Arc::new(ProxyPool::new(config.pools.clone()));
    if let Some(path) = config.proxies_file() {
        proxies.load_file(&path).await?;
    }

    let admission = build_admission(config).await;
    let adaptive = AdaptiveLimiter::new(config.rate_limit.clone());
    let checkpoint = SqliteCheckpointSink::new(config.checkpoint_db())?;

    let dispatcher = Arc::new(RequestDispatcher::new(
        direct_only(config.dispatch.clone()),
        admission,
        adaptive,
        proxies.clone(),
        None,
        crate::cancel::CancelFlag::new(),
    ));

    let engine = Arc::new(
        PaginationEngine::new(
            sessions.clone(),
            proxies,
            dispatcher,
            config.engine.clone(),
        )
        .with_checkpoint(Arc::new(checkpoint))
        .with_observer(Arc::new(LogObserver)),
    );

    let cancel = engine.cancel_flag();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current page");
                cancel.cancel();
            }
        }
    });

    let orchestrator = ChunkOrchestrator::new(engine, sessions, config.chunks.clone())
        .with_observer(Arc::new(LogObserver));
    let report = orchestrator.run(request).await;

    write_items(&report, output)?;
    print_report(&report);

    if report.terminal == Terminal::Failed {
        anyhow::bail!("crawl failed with {} item(s) salvaged", report.items.len());
    }
    Ok(())
}

async fn sessions(config: &AppConfig) -> anyhow::Result<()> {
    let pool = SessionPool::new(config.pools.clone());
    pool.load_all(&config.credentials_dir()).await?;

    let stats = pool.stats().await;
    if stats.is_empty() {
        println!("no sessions configured");
        return Ok(());
    }
    println!(
        "{:<24} {:>8} {:>8} {:>12} {:>8}",
        "SESSION", "USES", "ERRORS", "CONSECUTIVE", "STATE"
    );
    for s in stats {
        println!(
            "{:<24} {:>8} {:>8} {:>12} {:>8}",
            s.id,
            s.usage_count,
            s.error_count,
            s.consecutive_failures,
            if s.retired { "retired" } else { "active" }
        );
    }
    Ok(())
}

async fn build_admission(config: &AppConfig) -> AdmissionControl {
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &config.redis_url {
        match crate::rate_limit::RedisAdmission::new(url).await {
            Ok(backend) => {
                info!("admission control using shared counter store");
                return AdmissionControl::new(Arc::new(backend));
            }
            Err(e) => warn!("redis unavailable ({}), using in-process admission", e),
        }
    }
    #[cfg(not(feature = "redis-backend"))]
    if config.redis_url.is_some() {
        warn!("redis_url configured but this build lacks the redis-backend feature");
    }
    AdmissionControl::in_memory()
}

fn write_items(report: &ChunkRunReport, output: Option<&str>) -> anyhow::Result<()> {
    let mut lines = String::new();
    for item in &report.items {
        lines.push_str(&serde_json::to_string(item)?);
        lines.push('\n');
    }
    match output {
        Some(path) => {
            std::fs::write(path, lines)?;
            info!("wrote {} item(s) to {}", report.items.len(), path);
        }
        None => print!("{lines}"),
    }
    Ok(())
}

fn print_report(report: &ChunkRunReport) {
    eprintln!(
        "{}: {} item(s) across {} chunk(s), {} recovered on retry",
        report.terminal.as_str(),
        report.items.len(),
        report.chunk_count,
        report.recovered_on_retry
    );
    for range in &report.unrecovered {
        eprintln!(
            "  unrecovered {} [{} .. {}]: {}",
            range.label,
            range.since.format("%Y-%m-%d"),
            range.until.format("%Y-%m-%d"),
            range.error
        );
    }
}

/// Route every operation over direct transport.
///
/// The CLI wires no capture subsystem into the dispatcher, and an
/// operation routed to a missing capture subsystem fails outright, so
/// any configured capture routing is dropped here rather than at first
/// use.
fn direct_only(mut dispatch: DispatchConfig) -> DispatchConfig {
    if !dispatch.capture_operations.is_empty() {
        warn!(
            "no capture subsystem in this build; {} capture-routed operation(s) will go direct",
            dispatch.capture_operations.len()
        );
        dispatch.capture_operations.clear();
    }
    dispatch
}

/// Parse a YYYY-MM-DD date as midnight UTC.
fn parse_date(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("invalid date {:?}: {}", s, e))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid date {:?}", s))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

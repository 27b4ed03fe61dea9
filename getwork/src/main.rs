//! CLI runner for the getwork work source.
//!
//! Stands in for the enclosing framework: builds the work queue and chain
//! hooks, starts the source, keeps the queue near its fill target by issuing
//! demand tokens, and prints a stats line now and then.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use log::info;

use ironmine_core::{Blockchain, SourceStats, WorkQueue};
use ironmine_getwork::{GetworkConfig, GetworkSource};

#[derive(Parser, Debug)]
#[command(
    name = "ironmine-getwork",
    version,
    about = "Ironmine getwork work source - fetch jobs, upload shares, long poll"
)]
struct Cli {
    /// Pool or node host
    #[arg(long)]
    host: Option<String>,

    /// Pool or node port
    #[arg(long)]
    port: Option<u16>,

    /// Request path on the server
    #[arg(long)]
    path: Option<String>,

    /// HTTP Basic user name
    #[arg(short, long)]
    username: Option<String>,

    /// HTTP Basic password
    #[arg(short, long)]
    password: Option<String>,

    /// Config file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Job fetching connections
    #[arg(long)]
    fetchers: Option<usize>,

    /// Share upload connections
    #[arg(long)]
    uploaders: Option<usize>,

    /// Long poll connections (0 disables long polling)
    #[arg(long)]
    long_poll: Option<usize>,

    /// Work queue fill target
    #[arg(long, default_value_t = 8)]
    queue_target: usize,

    /// Seconds between stats lines
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Quiet mode (warnings only)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else if cli.quiet {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => GetworkConfig::from_file(path)?,
        None => GetworkConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.path {
        config.path = path;
    }
    if let Some(username) = cli.username {
        config.username = username;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(fetchers) = cli.fetchers {
        config.getwork_connections = fetchers;
    }
    if let Some(uploaders) = cli.uploaders {
        config.upload_connections = uploaders;
    }
    if let Some(long_poll) = cli.long_poll {
        config.long_poll_connections = long_poll;
    }
    config.validate()?;

    println!(
        "{} {}",
        "ironmine".bright_cyan().bold(),
        format!("getwork work source v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    info!("work source: {}", config.work_url());

    let work_queue = Arc::new(WorkQueue::new(cli.queue_target));
    let blockchain = Arc::new(Blockchain::new());
    let stats = Arc::new(SourceStats::new());
    let source = GetworkSource::new(
        config,
        Arc::clone(&work_queue),
        blockchain,
        Arc::clone(&stats),
        None,
    );
    source.start().context("failed to start work source")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("failed to install signal handler")?;
    }

    // Demand pump: keep the queue near its fill target, the way the
    // framework scheduler would.
    let mut last_stats = Instant::now();
    while running.load(Ordering::SeqCst) {
        while work_queue.count() < work_queue.target() {
            match source.start_fetcher() {
                Some((1, _)) => continue,
                // all workers busy, or the source is stopped
                _ => break,
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(cli.stats_interval.max(1)) {
            last_stats = Instant::now();
            let snap = source.statistics();
            info!(
                "jobs {} | accepted {} | rejected {} | retries {} | errors {} | rollntime {} | longpoll {}",
                snap.jobs_received,
                snap.shares_accepted,
                snap.shares_rejected,
                snap.submit_retries,
                snap.transport_errors,
                match snap.supports_rollntime {
                    Some(true) => "yes",
                    Some(false) => "no",
                    None => "?",
                },
                if source.signals_new_block() { "on" } else { "off" },
            );
        }

        thread::sleep(Duration::from_millis(500));
    }

    info!("shutting down");
    source.stop();
    Ok(())
}

//! Quarry main entry point
//!
//! This is the command-line interface for the Quarry record crawler.

use anyhow::{bail, Context};
use clap::Parser;
use quarry::config::{load_config_with_hash, Config};
use quarry::crawler::Coordinator;
use quarry::output::{load_statistics, print_report, print_statistics};
use quarry::storage::open_storage;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Quarry: a polite, resumable record crawler
///
/// Quarry walks a seed set and the links it is told to follow, extracts
/// records with CSS selectors and appends them to a JSON Lines dataset,
/// while keeping per-host request rates polite.
#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(version)]
#[command(about = "A polite, resumable record crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume an interrupted or limited crawl (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start a fresh crawl, ignoring previous state
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the crawl-state database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_crawl(config, config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("quarry=info,warn"),
            1 => EnvFilter::new("quarry=debug,info"),
            2 => EnvFilter::new("quarry=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn display_limit<T: std::fmt::Display>(limit: Option<T>) -> String {
    limit.map(|l| l.to_string()).unwrap_or_else(|| "unbounded".to_string())
}

/// Handles the --dry-run mode: shows what would be crawled
fn handle_dry_run(config: &Config) {
    let crawler = &config.crawler;
    println!("=== Quarry Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Max requests: {}", display_limit(crawler.max_requests));
    println!("  Max depth: {}", display_limit(crawler.max_depth));
    println!("  Workers: {}", crawler.max_concurrency);
    println!(
        "  Per host: {} concurrent, {}ms between requests",
        crawler.per_host_concurrency, crawler.per_host_delay_ms
    );
    println!(
        "  Fetch timeout: {}ms, {} retries (backoff {}ms)",
        crawler.fetch_timeout_ms, crawler.retry_count, crawler.retry_backoff_ms
    );
    println!("  Enqueue strategy: {:?}", crawler.enqueue_strategy);

    println!("\nUser Agent: {}", config.user_agent.header_value());

    println!("\nOutput:");
    println!("  Dataset: {}", config.output.dataset_path);
    match &config.output.state_path {
        Some(path) => println!("  Crawl state: {}", path),
        None => println!("  Crawl state: none (runs are not resumable)"),
    }

    println!("\nExtraction:");
    println!("  Records: {}", config.extract.record_selector);
    if let Some(follow) = &config.extract.follow_link_selector {
        println!("  Follow links: {}", follow);
    }
    for field in &config.extract.fields {
        println!(
            "  - {} <- {}{} ({:?}{})",
            field.name,
            field.selector,
            field
                .attribute
                .as_ref()
                .map(|a| format!(" @{}", a))
                .unwrap_or_default(),
            field.kind,
            if field.required { ", required" } else { "" }
        );
    }

    println!("\nSeed URLs ({}):", crawler.seed_urls.len());
    for seed in &crawler.seed_urls {
        println!("  * {}", seed);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the crawl-state database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    let Some(state_path) = &config.output.state_path else {
        bail!("no state-path configured; there is no crawl state to inspect");
    };

    println!("Database: {}\n", state_path);

    let storage = open_storage(Path::new(state_path))
        .with_context(|| format!("failed to open crawl state at {}", state_path))?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh crawl (ignoring previous state)");
    } else {
        tracing::info!("Starting crawl (will resume if a resumable run exists)");
    }
    tracing::info!("Seed URLs: {}", config.crawler.seed_urls.len());

    let mut coordinator = Coordinator::builder(config)
        .fresh(fresh)
        .config_hash(config_hash)
        .build()
        .context("failed to start crawl")?;

    let abort = coordinator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight requests");
            abort.abort();
        }
    });

    let report = coordinator.run().await?;
    print_report(&report);

    if report.is_failure() {
        bail!("crawl {}", report.headline());
    }
    Ok(())
}

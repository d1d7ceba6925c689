//! Cohort Indexer - incremental subgraph sync for DeFi protocol events
//!
//! This binary provides:
//! - One sync task per configured protocol
//! - Cursor registration and failed-range reconciliation
//! - Status reporting over the shared SQLite database
//!
//! Note: The HTTP API is provided by the separate `cohort-api` service

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cohort_indexer::config::{Config, LoggingConfig};
use cohort_indexer::control::{self, RegisterRequest};
use cohort_indexer::listener::{SubgraphProvider, SyncEngine};
use cohort_indexer::storage::Storage;
use cohort_indexer::Protocol;
use tokio::task::JoinSet;
use tracing::{info, warn};

const DEFAULT_DATABASE_URL: &str = "sqlite://cohort.db";

#[derive(Parser)]
#[command(name = "cohort-indexer")]
#[command(version, about = "Cohort indexer for DeFi protocol subgraphs", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "indexer.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync service for every configured protocol
    Run,

    /// Show cursors, failed ranges and row counts
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = DEFAULT_DATABASE_URL)]
        database_url: String,
    },

    /// Register a sync cursor for a protocol
    Register {
        /// Protocol name (uniswap-v3, lido, aave-v2)
        #[arg(long)]
        protocol: String,

        /// Last block considered already synced
        #[arg(long)]
        block: u64,
    },

    /// Retry every recorded failed range of a protocol
    Reconcile {
        /// Protocol name (uniswap-v3, lido, aave-v2)
        #[arg(long)]
        protocol: Protocol,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config when it loads; the command
    // itself reports any config error.
    let logging = Config::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging)?;

    info!("Cohort Indexer starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_indexer(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
        Commands::Register { protocol, block } => {
            register_protocol(&cli.config, protocol, block).await?
        }
        Commands::Reconcile { protocol } => reconcile_protocol(&cli.config, protocol).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("cohort_indexer=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("cohort_indexer={}", logging.level)))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_line_number(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<Storage> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await
    .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    Ok(storage)
}

/// Main indexer service - one sync engine per configured protocol
async fn run_indexer(config_path: &str) -> Result<()> {
    info!("Starting indexer service with config: {}", config_path);

    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    if config.protocols.is_empty() {
        bail!("No protocols configured in {}", config_path);
    }

    info!("Configuration loaded successfully");
    info!("  Database: {}", config.database.url);
    info!("  Poll interval: {}s", config.sync.poll_interval_secs);
    info!("  Requests per second: {}", config.sync.requests_per_second);

    let storage = connect(&config).await?;
    info!("Database initialized");

    let mut tasks = JoinSet::new();
    for protocol in &config.protocols {
        if let Some(start_block) = protocol.start_block {
            if storage.insert_cursor(protocol.name, start_block).await? {
                info!(protocol = %protocol.name, start_block, "Registered sync cursor");
            }
        }

        if storage.get_cursor(protocol.name).await?.is_none() {
            warn!(
                protocol = %protocol.name,
                "No sync cursor registered; the engine idles until one is"
            );
        }

        let provider = SubgraphProvider::new(
            protocol.name,
            &protocol.endpoint,
            config.sync.request_timeout(),
        )
        .with_context(|| format!("Failed to create subgraph provider for {}", protocol.name))?;

        let engine = SyncEngine::new(provider, storage.clone(), &config.sync);
        let poll_interval = config.sync.poll_interval();
        tasks.spawn(async move { engine.run(poll_interval).await });

        info!(protocol = %protocol.name, endpoint = %protocol.endpoint, "Sync engine started");
    }

    info!("Indexer is running. Press Ctrl+C to stop.");
    info!("For API queries, run the cohort-api service separately.");

    // Wait for either Ctrl+C or task failures
    tokio::select! {
        result = tasks.join_next() => {
            storage.close().await;
            match result {
                Some(Err(e)) => Err(anyhow::anyhow!("Sync task panicked: {}", e)),
                _ => {
                    warn!("Sync engine exited unexpectedly");
                    Ok(())
                }
            }
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal, gracefully shutting down...");
            storage.close().await;
            Ok(())
        }
    }
}

/// Register a cursor through the control surface
async fn register_protocol(config_path: &str, protocol: String, block: u64) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = connect(&config).await?;

    let result = control::register_cursor(
        &storage,
        &RegisterRequest {
            protocol,
            block_number: block,
        },
    )
    .await;
    storage.close().await;

    let cursor = result?;
    info!(
        "Registered {} at block {}",
        cursor.protocol, cursor.block_number
    );

    Ok(())
}

/// Retry failed ranges of one protocol
async fn reconcile_protocol(config_path: &str, protocol: Protocol) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let endpoint = config
        .protocol(protocol)
        .with_context(|| format!("Protocol {} is not configured", protocol))?
        .endpoint
        .clone();

    let storage = connect(&config).await?;
    let provider = SubgraphProvider::new(protocol, &endpoint, config.sync.request_timeout())?;
    let engine = SyncEngine::new(provider, storage.clone(), &config.sync);

    let result = engine.reconcile().await;
    storage.close().await;

    match result? {
        Some(report) => {
            println!("\n=== Reconciliation: {} ===\n", protocol);
            println!("  Recovered ranges: {}", report.recovered.len());
            for (from, to) in &report.recovered {
                println!("    {}..={}", from, to);
            }
            println!("  Still failing: {}", report.still_failing.len());
            for failure in &report.still_failing {
                println!(
                    "    {}..={}: {}",
                    failure.from_block, failure.to_block, failure.error
                );
            }
            println!("  Events stored: {}", report.ingested.total_events());
            println!();
        }
        None => warn!("Sync pass in progress for {}, try again later", protocol),
    }

    Ok(())
}

/// Show cursors, failures and database statistics
async fn show_status(config_path: &str) -> Result<()> {
    info!("Checking indexer status");

    // Try to load configuration, fall back to default database ONLY if file doesn't exist
    let (database_url, max_conn, min_conn) = match Config::from_file(config_path) {
        Ok(config) => {
            info!("Using database from config: {}", config.database.url);
            (
                config.database.url,
                Some(config.database.max_connections),
                Some(config.database.min_connections),
            )
        }
        Err(e) => {
            // Config::from_file wraps errors with context, so walk the chain
            let is_not_found = e.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
            });

            if is_not_found {
                info!(
                    "Config file not found, using default database: {}",
                    DEFAULT_DATABASE_URL
                );
                (DEFAULT_DATABASE_URL.to_string(), None, None)
            } else {
                return Err(e).context("Failed to load config file");
            }
        }
    };

    let storage = Storage::new(&database_url, max_conn, min_conn)
        .await
        .context("Failed to connect to database")?;

    // Run migrations to ensure schema exists (handles fresh database)
    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let cursors = storage.list_cursors().await?;
    let stats = storage.stats().await?;

    println!("\n=== Cohort Indexer Status ===\n");
    if cursors.is_empty() {
        println!("No sync cursors registered.");
    }
    for cursor in &cursors {
        let failures = storage.count_failures(cursor.protocol).await?;
        println!("{}:", cursor.protocol);
        println!("  Block: {}", cursor.block_number);
        println!(
            "  Syncing: {}{}",
            cursor.syncing,
            cursor
                .lease_owner
                .as_deref()
                .map(|owner| format!(" (owner {})", owner))
                .unwrap_or_default()
        );
        println!(
            "  Last Updated: {}",
            chrono::DateTime::from_timestamp(cursor.updated_at, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );
        println!("  Failed Ranges: {}", failures);
    }

    println!("\nDatabase Statistics:");
    println!("  Tokens: {}", stats.token_count);
    println!("  Failed Ranges: {}", stats.failure_count);
    for (selector, count) in &stats.event_counts {
        println!("  {}: {}", selector, count);
    }

    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  Cursors: {}", stats.cursor_count);
    info!("  Tokens: {}", stats.token_count);
    info!("  Failed ranges: {}", stats.failure_count);

    storage.close().await;

    Ok(())
}

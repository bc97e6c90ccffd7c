//! Binary entrypoint for the meshcollectd CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `run` - ingest capture lines from stdin and run the maintenance jobs
//! - `replay <file>` - ingest a capture file, flush, exit
//! - `decode <topic> <hex>` - decode one payload and print it as JSON
//! - `distill` - run the distillation engine once
//! - `cleanup [--days N] [--dry-run]` - prune raw rows older than the retention window
//! - `status` - row counts for the raw and distilled stores
//!
//! See the library crate docs for module-level details: `meshcollectd::`.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};

use meshcollectd::collector::{Collector, MaintenanceScheduler};
use meshcollectd::config::Config;
use meshcollectd::distill::{hour_bucket, DistillationEngine, DistilledStore};
use meshcollectd::meshtastic::decoder::MessageDecoder;
use meshcollectd::metrics::IngestMetrics;
use meshcollectd::storage::retention;
use meshcollectd::storage::SledStore;
use meshcollectd::transport::pump_lines;

const INBOUND_CAPACITY: usize = 1024;
const MAINTENANCE_POLL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "meshcollectd")]
#[command(about = "Collect, decode and persist Meshtastic MQTT traffic")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Ingest capture lines (`<topic> <hex>`) from stdin until EOF or Ctrl-C
    Run,
    /// Ingest a capture file and exit once everything is persisted
    Replay {
        /// Capture file, one `<topic> <hex>` message per line
        file: String,
    },
    /// Decode a single payload and print the result
    Decode {
        /// MQTT topic the payload arrived on
        topic: String,
        /// Payload bytes as hex
        hex: String,
    },
    /// Run the distillation engine once
    Distill,
    /// Delete raw rows older than the retention window
    Cleanup {
        /// Override `retention.days`
        #[arg(long)]
        days: Option<u32>,
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,
    },
    /// Show store row counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        if Path::new(&cli.config).exists() {
            warn!("{} already exists; leaving it untouched", cli.config);
            return Ok(());
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = load_config(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    match cli.command {
        // written before any config is loaded
        Commands::Init => {}
        Commands::Run => run_collector(config).await?,
        Commands::Replay { file } => {
            let input = tokio::fs::File::open(&file)
                .await
                .map_err(|e| anyhow!("Failed to open capture file {}: {}", file, e))?;
            let store = SledStore::open(config.storage.raw_db_path())?;
            let metrics = Arc::new(IngestMetrics::new());
            let collector = Collector::new(&config, store.clone(), metrics.clone())?;
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            let ingest = tokio::spawn(collector.run(rx));
            let forwarded = pump_lines(BufReader::new(input), tx).await?;
            let stats = ingest
                .await
                .map_err(|e| anyhow!("collector task failed: {}", e))??;
            store.flush()?;
            println!("replayed {} message(s) from {}", forwarded, file);
            println!("{}", metrics.snapshot());
            println!("ops processed={} failed={}", stats.processed, stats.failed);
        }
        Commands::Decode { topic, hex } => {
            let payload = hex::decode(hex.trim())
                .map_err(|e| anyhow!("payload is not valid hex: {}", e))?;
            let decoder = MessageDecoder::from_config(&config.collector)
                .map_err(|e| anyhow!("Invalid channel key configuration: {}", e))?;
            let decoded = decoder.decode(&topic, &payload, chrono::Utc::now().timestamp())?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
        Commands::Distill => {
            let raw = SledStore::open(config.storage.raw_db_path())?;
            let distilled = DistilledStore::open(config.storage.distilled_db_path())?;
            let engine = DistillationEngine::new(raw, distilled, config.distill.options());
            let report = engine.run(chrono::Utc::now().timestamp())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cleanup { days, dry_run } => {
            let days = days.unwrap_or(config.retention.days);
            if days == 0 {
                return Err(anyhow!("--days must be greater than 0"));
            }
            let store = SledStore::open(config.storage.raw_db_path())?;
            let cutoff = retention::cutoff_for_days(chrono::Utc::now().timestamp(), days);
            let report =
                retention::cleanup(&store, cutoff, config.retention.batch_size, dry_run)?;
            for (tree, n) in &report.deleted {
                println!(
                    "{:<12} {} {}",
                    tree,
                    if dry_run { "would delete" } else { "deleted" },
                    n
                );
            }
            println!("nodes with last_seen cleared: {}", report.nodes_cleared);
        }
        Commands::Status => {
            let store = SledStore::open(config.storage.raw_db_path())?;
            let distilled = DistilledStore::open(config.storage.distilled_db_path())?;
            let counts = store.counts();
            println!("meshcollectd status");
            println!("  data dir:     {}", config.storage.data_dir);
            println!("  nodes:        {}", counts.nodes);
            println!("  messages:     {}", counts.messages);
            println!("  neighbors:    {}", counts.neighbors);
            println!("  traceroutes:  {}", counts.traceroutes);
            println!("  node counts:  {}", counts.nodes_count);
            let (hourly, daily) = distilled.row_counts();
            println!("  hourly rows:  {}", hourly);
            println!("  daily rows:   {}", daily);
            match distilled.last_distilled_hour()? {
                Some(hour) => println!("  distilled to: {}", hour_bucket(hour)),
                None => println!("  distilled to: never"),
            }
        }
    }

    Ok(())
}

/// Missing file means defaults; a file that exists but does not parse or validate is fatal.
async fn load_config(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        Config::load(path).await?
    } else {
        eprintln!("{} not found; using built-in defaults", path);
        Config::default()
    };
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration in {}: {}", path, e))?;
    Ok(config)
}

async fn run_collector(config: Config) -> Result<()> {
    info!("Starting meshcollectd v{}", env!("CARGO_PKG_VERSION"));
    let store = SledStore::open(config.storage.raw_db_path())?;
    let distilled = DistilledStore::open(config.storage.distilled_db_path())?;
    let metrics = Arc::new(IngestMetrics::new());

    let collector = Collector::new(&config, store.clone(), metrics.clone())?;
    let scheduler = MaintenanceScheduler::new(&config, store.clone(), distilled);

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let ingest = tokio::spawn(collector.run(rx));
    let (stop_tx, stop_rx) = oneshot::channel();
    let maintenance = tokio::spawn(scheduler.run(MAINTENANCE_POLL, stop_rx));

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        res = pump_lines(stdin, tx) => match res {
            Ok(n) => info!("capture input ended after {} message(s)", n),
            Err(e) => warn!("capture input failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
    }

    let stats = ingest
        .await
        .map_err(|e| anyhow!("collector task failed: {}", e))??;
    let _ = stop_tx.send(());
    if let Err(e) = maintenance.await {
        warn!("maintenance task ended abnormally: {}", e);
    }
    store.flush()?;
    info!(
        "shutdown complete: {} (ops processed={} failed={})",
        metrics.snapshot(),
        stats.processed,
        stats.failed
    );
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.clone())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = Arc::new(std::sync::Mutex::new(f));
        // Tee to the console only in the foreground
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}

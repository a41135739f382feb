//! `msr-engine` — live retest-capture signal engine.
//!
//! Subcommands:
//!   - `run`        — start the ingestion pipeline against Binance futures
//!   - `check-data` — per-series row/gap/freshness report over the bar store

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use msr_core::config::TradingConfig;
use msr_core::ports::{BarStore, EngineEvent};
use msr_runtime::binance::BinanceSource;
use msr_runtime::{CoreEngine, EngineStores, EventBus, IngestionPipeline};
use msr_store::{
    open_pool, SqliteBarStore, SqliteCheckpointStore, SqliteSignalStore, SqliteStreakStore,
};

#[derive(Parser)]
#[command(
    name = "msr-engine",
    version,
    about = "Mean-reversion retest signal engine for crypto perpetual futures",
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live engine
    Run(RunArgs),
    /// Report bar-store coverage per (symbol, timeframe)
    CheckData(CheckDataArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Path to the trading YAML config (missing file = portfolio B defaults)
    #[arg(long, default_value = "trading.yaml")]
    config: PathBuf,

    /// Path to the engine SQLite database
    #[arg(long, default_value = "msr_engine.db")]
    db: PathBuf,

    /// Disable the signal quality filters (every candidate emits)
    #[arg(long, default_value_t = false)]
    no_filters: bool,
}

#[derive(Parser)]
struct CheckDataArgs {
    #[arg(long, default_value = "trading.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "msr_engine.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run(args) => run(args).await,
        Commands::CheckData(args) => check_data(args),
    }
}

fn open_stores(db: &PathBuf) -> Result<EngineStores> {
    let pool = open_pool(db, 4).context("open engine database")?;
    Ok(EngineStores {
        bars: Arc::new(SqliteBarStore::new(pool.clone())),
        signals: Arc::new(SqliteSignalStore::new(pool.clone())),
        streaks: Arc::new(SqliteStreakStore::new(pool.clone())),
        checkpoints: Arc::new(SqliteCheckpointStore::new(pool)),
    })
}

async fn run(args: RunArgs) -> Result<()> {
    let cfg = TradingConfig::load(&args.config).context("load trading config")?;
    let filters = if args.no_filters {
        None
    } else {
        Some(cfg.filter_table())
    };
    let stores = open_stores(&args.db)?;
    let bus = EventBus::new();
    spawn_event_logger(&bus);

    let engine = CoreEngine::new(cfg, filters, stores, bus);
    let source = BinanceSource::from_env()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = IngestionPipeline::new(engine, source, shutdown_rx)
        .run()
        .await?;
    tracing::info!(
        stale = report.stale_bars_dropped,
        invalid = report.invalid_bars_dropped,
        "engine drained"
    );
    Ok(())
}

/// Mirror engine events into the log so an operator tailing the process
/// sees emissions and outcomes without a bus consumer attached.
fn spawn_event_logger(bus: &EventBus) {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::SignalEmitted(sig)) => {
                    tracing::info!(
                        id = %sig.id,
                        direction = %sig.direction,
                        entry = sig.entry,
                        tp = sig.tp,
                        sl = sig.sl,
                        "EMITTED"
                    );
                }
                Ok(EngineEvent::SignalClosed { id, state, close_price, .. }) => {
                    tracing::info!(id = %id, state = state.as_str(), close_price, "CLOSED");
                }
                Ok(EngineEvent::SignalMaeUpdated { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn check_data(args: CheckDataArgs) -> Result<()> {
    let cfg = TradingConfig::load(&args.config).context("load trading config")?;
    let stores = open_stores(&args.db)?;
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    for symbol in &cfg.symbols {
        for &tf in &cfg.timeframes {
            let times = stores.bars.open_times_between(symbol, tf, 0, i64::MAX)?;
            if times.is_empty() {
                println!("{symbol} {tf} rows=0");
                continue;
            }

            let period = tf.period_ms();
            let mut gap_bars = 0i64;
            let mut max_gap = 0i64;
            for pair in times.windows(2) {
                let diff = pair[1] - pair[0];
                if diff > period {
                    let missing = diff / period - 1;
                    gap_bars += missing;
                    max_gap = max_gap.max(missing);
                }
            }
            let last_close_age_s =
                (now_ms - (times.last().unwrap() + period)).max(0) as f64 / 1000.0;

            println!(
                "{symbol} {tf} rows={} min_t={} max_t={} gaps={} max_gap={} last_close_age_s={:.1}",
                times.len(),
                times.first().unwrap(),
                times.last().unwrap(),
                gap_bars,
                max_gap,
                last_close_age_s,
            );
        }
    }
    Ok(())
}

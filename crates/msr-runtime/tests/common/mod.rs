//! Shared fixtures for the runtime integration suites.

use std::sync::Arc;

use msr_core::candle::{Candle, Timeframe};
use msr_core::config::TradingConfig;
use msr_core::ports::{CheckpointStatus, CheckpointStore, ProcessingCheckpoint};
use msr_runtime::EngineStores;
use msr_store::{
    open_memory_pool, SqliteBarStore, SqliteCheckpointStore, SqliteSignalStore, SqliteStreakStore,
};

pub const SYMBOL: &str = "BTCUSDT";

pub fn memory_stores() -> EngineStores {
    let pool = open_memory_pool().expect("memory pool");
    EngineStores {
        bars: Arc::new(SqliteBarStore::new(pool.clone())),
        signals: Arc::new(SqliteSignalStore::new(pool.clone())),
        streaks: Arc::new(SqliteStreakStore::new(pool.clone())),
        checkpoints: Arc::new(SqliteCheckpointStore::new(pool)),
    }
}

pub fn test_config() -> TradingConfig {
    let mut cfg = TradingConfig::default();
    cfg.symbols = vec![SYMBOL.to_string()];
    cfg.ingestion.reconnect_secs = 1;
    cfg
}

/// Deterministic 1m price path with recurring retest activity.
///
/// Bars 0..59 oscillate for indicator warmup; afterwards every 20-bar
/// cycle carries a spike, a bullish dip back onto the fresh supports (the
/// short retest entry) and a plunge through the take-profit.
pub fn scripted_bar(i: i64) -> Candle {
    let base = 100.0 + (i % 7) as f64 * 0.2;
    let (open, high, low, close) = if i < 60 {
        (base, base + 0.5, base - 0.5, base + 0.1)
    } else {
        match i % 20 {
            6 => (101.0, 106.2, 100.8, 106.0),
            7 => (103.5, 104.5, 103.4, 104.2),
            8 => (104.0, 104.2, 100.5, 101.0),
            _ => (base, base + 0.5, base - 0.5, base + 0.1),
        }
    };
    Candle {
        symbol: SYMBOL.to_string(),
        timeframe: Timeframe::M1,
        open_time_ms: i * 60_000,
        open,
        high,
        low,
        close,
        volume: 1.0,
        closed: true,
    }
}

pub fn scripted_bars(n: i64) -> Vec<Candle> {
    (0..n).map(scripted_bar).collect()
}

/// Seed the 1m checkpoint one period before the first scripted bar so a
/// replay covers the whole script.
pub fn seed_checkpoint(checkpoints: &dyn CheckpointStore) {
    checkpoints
        .upsert(&ProcessingCheckpoint {
            symbol: SYMBOL.to_string(),
            timeframe: Timeframe::M1,
            last_processed_ms: -60_000,
            status: CheckpointStatus::Confirmed,
        })
        .expect("seed checkpoint");
}

/// Poll the checkpoint store until the 1m checkpoint is confirmed at
/// `expect_ms`.
pub async fn wait_for_checkpoint(
    checkpoints: Arc<dyn CheckpointStore>,
    expect_ms: i64,
) {
    for _ in 0..600 {
        if let Ok(Some(cp)) = checkpoints.get(SYMBOL, Timeframe::M1) {
            if cp.status == CheckpointStatus::Confirmed && cp.last_processed_ms == expect_ms {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("checkpoint never reached {expect_ms}");
}

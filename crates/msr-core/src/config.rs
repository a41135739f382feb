//! Typed engine configuration.
//!
//! Loaded from a YAML file (`trading.yaml` by convention); every section
//! has full defaults so a missing file means "portfolio B, default
//! strategy parameters". Runtime knobs (bind paths, DB location) stay in
//! environment variables and never live here.

use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;

use crate::candle::Timeframe;
use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Strategy parameters
// ---------------------------------------------------------------------------

/// Indicator and pricing parameters of the retest strategy. Defaults match
/// the Pine Script study the strategy was validated against.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub ema_period: usize,
    pub atr_period: usize,
    pub fib_window: usize,
    pub tp_atr_mult: f64,
    pub sl_atr_mult: f64,
    /// Minimum summed level-proximity score on the touched side.
    pub score_threshold: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ema_period: 50,
            atr_period: 9,
            fib_window: 9,
            tp_atr_mult: 2.0,
            sl_atr_mult: 8.84, // 2.0 * 4.42 — wide stop, narrow target
            score_threshold: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Signal quality filter
// ---------------------------------------------------------------------------

/// Per-(symbol, timeframe) quality filter. Only whitelisted series emit
/// signals once a filter table is loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Accept signals with streak_at_signal in [streak_lo, streak_hi].
    #[serde(default = "default_streak_lo")]
    pub streak_lo: i32,
    #[serde(default = "default_streak_hi")]
    pub streak_hi: i32,
    /// Accept signals whose ATR percentile is strictly greater than this.
    /// 0.0 disables the percentile check for the entry.
    #[serde(default)]
    pub atr_pct_threshold: f64,
    /// Position size in asset units for the execution adapter downstream.
    #[serde(default)]
    pub position_qty: f64,
}

fn default_true() -> bool {
    true
}
fn default_streak_lo() -> i32 {
    -999
}
fn default_streak_hi() -> i32 {
    999
}

impl FilterConfig {
    fn preset(
        symbol: &str,
        timeframe: Timeframe,
        streak_lo: i32,
        streak_hi: i32,
        atr_pct_threshold: f64,
        position_qty: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            enabled: true,
            streak_lo,
            streak_hi,
            atr_pct_threshold,
            position_qty,
        }
    }
}

/// Portfolio A: 4 strategies, lowest drawdown.
pub fn portfolio_a() -> Vec<FilterConfig> {
    vec![
        FilterConfig::preset("XRPUSDT", Timeframe::M30, 0, 3, 0.60, 50_000.0),
        FilterConfig::preset("SOLUSDT", Timeframe::M5, 0, 3, 0.80, 500.0),
        FilterConfig::preset("BTCUSDT", Timeframe::M15, 0, 7, 0.90, 1.0),
        FilterConfig::preset("ETHUSDT", Timeframe::M30, 0, 4, 0.90, 10.0),
    ]
}

/// Portfolio B: 5 walk-forward validated strategies (recommended default).
pub fn portfolio_b() -> Vec<FilterConfig> {
    vec![
        FilterConfig::preset("XRPUSDT", Timeframe::M30, 0, 3, 0.60, 50_000.0),
        FilterConfig::preset("XRPUSDT", Timeframe::M15, 0, 4, 0.80, 50_000.0),
        FilterConfig::preset("SOLUSDT", Timeframe::M5, 0, 3, 0.80, 500.0),
        FilterConfig::preset("BTCUSDT", Timeframe::M15, 0, 7, 0.90, 1.0),
        FilterConfig::preset("BTCUSDT", Timeframe::M5, 0, 3, 0.90, 1.0),
    ]
}

/// Resolved filter table keyed by series. `None` (no table loaded) makes
/// the gate accept every candidate — legacy/backtest mode.
pub type FilterTable = FxHashMap<(String, Timeframe), FilterConfig>;

// ---------------------------------------------------------------------------
// Tracker / ingestion sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AtrTrackerConfig {
    pub max_history: usize,
    pub min_samples: usize,
    /// Bars of persisted history replayed into the tracker at RESTORE.
    pub warmup_bars: usize,
}

impl Default for AtrTrackerConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            min_samples: 200,
            warmup_bars: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Max closed 1m bars queued while the pipeline is not yet LIVE.
    pub buffer_capacity: usize,
    /// Checkpoint cadence during REPLAY (bars).
    pub replay_checkpoint_every: usize,
    /// First-run backfill window (hours).
    pub initial_history_hours: i64,
    /// Bars of persisted history loaded per series at RESTORE.
    pub restore_bars: usize,
    /// Whole-startup (INIT→LIVE) deadline.
    pub startup_deadline_s: u64,
    /// Timeout for exchange-port calls (subscribe, bar fetch). An elapsed
    /// call re-enters INIT as a disconnect.
    pub port_timeout_s: u64,
    /// Initial reconnect delay after a disconnect. Doubles on every
    /// consecutive failed attempt and resets once a subscription opens.
    pub reconnect_secs: u64,
    /// Cap for the reconnect backoff.
    pub reconnect_max_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            replay_checkpoint_every: 100,
            initial_history_hours: 48,
            restore_bars: 200,
            startup_deadline_s: 600,
            port_timeout_s: 30,
            reconnect_secs: 1,
            reconnect_max_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Root config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Portfolio {
    A,
    B,
    #[serde(rename = "custom")]
    Custom,
}

fn default_symbols() -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}

fn default_portfolio() -> Portfolio {
    Portfolio::B
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_portfolio")]
    pub portfolio: Portfolio,
    /// Inline entries for `portfolio: custom`.
    #[serde(default)]
    pub strategies: Vec<FilterConfig>,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub atr_tracker: AtrTrackerConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            portfolio: default_portfolio(),
            strategies: Vec::new(),
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            strategy: StrategyConfig::default(),
            atr_tracker: AtrTrackerConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

impl TradingConfig {
    /// Load from a YAML file. A missing file falls back to defaults.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no trading config found, using defaults (portfolio B)");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.portfolio == Portfolio::Custom && self.strategies.is_empty() {
            return Err(CoreError::Config(
                "portfolio 'custom' requires at least one entry in 'strategies'".to_string(),
            ));
        }
        if self.symbols.is_empty() {
            return Err(CoreError::Config("no symbols configured".to_string()));
        }
        if !self.timeframes.contains(&Timeframe::M1) {
            return Err(CoreError::Config(
                "timeframes must include 1m (the ingestion base)".to_string(),
            ));
        }
        for f in &self.strategies {
            if f.streak_lo > f.streak_hi {
                return Err(CoreError::Config(format!(
                    "{} {}: streak_lo {} > streak_hi {}",
                    f.symbol, f.timeframe, f.streak_lo, f.streak_hi
                )));
            }
            if !(0.0..=1.0).contains(&f.atr_pct_threshold) {
                return Err(CoreError::Config(format!(
                    "{} {}: atr_pct_threshold {} outside [0, 1]",
                    f.symbol, f.timeframe, f.atr_pct_threshold
                )));
            }
        }
        Ok(())
    }

    /// Resolve the portfolio selection to the filter entries it names.
    pub fn signal_filters(&self) -> Vec<FilterConfig> {
        match self.portfolio {
            Portfolio::A => portfolio_a(),
            Portfolio::B => portfolio_b(),
            Portfolio::Custom => self.strategies.clone(),
        }
    }

    /// Resolved filter table for the gate.
    pub fn filter_table(&self) -> FilterTable {
        self.signal_filters()
            .into_iter()
            .map(|f| ((f.symbol.clone(), f.timeframe), f))
            .collect()
    }
}

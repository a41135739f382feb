//! Collaborator contracts.
//!
//! The kernel persists nothing itself; external layers implement these
//! traits (SQLite in `msr-store`, no-ops for tests and backtests). Stores
//! are synchronous — SQLite is synchronous and every call happens on the
//! single engine task that owns the core state.

use serde::{Deserialize, Serialize};

use crate::candle::{Candle, SeriesKey, Timeframe};
use crate::error::CoreResult;
use crate::signal::{Signal, SignalState};
use crate::streak::StreakTracker;

// ---------------------------------------------------------------------------
// Processing checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// A replay is in flight; on crash this window is re-replayed.
    Pending,
    Confirmed,
}

/// Replay progress for one (symbol, timeframe) series.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingCheckpoint {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub last_processed_ms: i64,
    pub status: CheckpointStatus,
}

// ---------------------------------------------------------------------------
// Store ports
// ---------------------------------------------------------------------------

pub trait BarStore: Send + Sync {
    fn upsert(&self, bar: &Candle) -> CoreResult<()>;
    fn upsert_batch(&self, bars: &[Candle]) -> CoreResult<()>;
    /// Closed bars with `from_ms <= open_time < to_ms`, ascending.
    fn range(&self, symbol: &str, timeframe: Timeframe, from_ms: i64, to_ms: i64)
        -> CoreResult<Vec<Candle>>;
    fn last_open_time(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<Option<i64>>;
    /// Most recent `n` bars, ascending.
    fn tail(&self, symbol: &str, timeframe: Timeframe, n: usize) -> CoreResult<Vec<Candle>>;
    /// Most recent `n` bars with `open_time <= until_ms`, ascending. The
    /// RESTORE phase uses this to rebuild state as of a checkpoint without
    /// consuming the bars that REPLAY is about to feed.
    fn tail_until(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        until_ms: i64,
        n: usize,
    ) -> CoreResult<Vec<Candle>>;
    /// Stored open times in `[from_ms, to_ms)`, ascending — gap scan input.
    fn open_times_between(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from_ms: i64,
        to_ms: i64,
    ) -> CoreResult<Vec<i64>>;
}

pub trait SignalStore: Send + Sync {
    fn save(&self, signal: &Signal) -> CoreResult<()>;
    fn update_state(
        &self,
        signal_id: &str,
        state: SignalState,
        close_time_ms: i64,
        close_price: f64,
    ) -> CoreResult<()>;
    fn update_mae_mfe(&self, signal_id: &str, mae_ratio: f64, mfe_ratio: f64) -> CoreResult<()>;
    fn load_active(&self) -> CoreResult<Vec<Signal>>;
}

pub trait StreakStore: Send + Sync {
    fn save(&self, symbol: &str, timeframe: Timeframe, tracker: &StreakTracker) -> CoreResult<()>;
    fn load_all(&self) -> CoreResult<Vec<(SeriesKey, StreakTracker)>>;
}

pub trait CheckpointStore: Send + Sync {
    fn get(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<Option<ProcessingCheckpoint>>;
    fn upsert(&self, checkpoint: &ProcessingCheckpoint) -> CoreResult<()>;
    fn mark_pending(&self, symbol: &str, timeframe: Timeframe) -> CoreResult<()>;
    fn load_pending(&self) -> CoreResult<Vec<ProcessingCheckpoint>>;
}

// ---------------------------------------------------------------------------
// Observer bus payloads
// ---------------------------------------------------------------------------

/// Events published to downstream observers (API, dashboard, execution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    SignalEmitted(Signal),
    SignalMaeUpdated {
        id: String,
        mae_ratio: f64,
        mfe_ratio: f64,
    },
    SignalClosed {
        id: String,
        state: SignalState,
        close_time_ms: i64,
        close_price: f64,
    },
}

// ---------------------------------------------------------------------------
// No-op stores (tests / backtest mode)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBarStore;

impl BarStore for NoopBarStore {
    fn upsert(&self, _bar: &Candle) -> CoreResult<()> {
        Ok(())
    }
    fn upsert_batch(&self, _bars: &[Candle]) -> CoreResult<()> {
        Ok(())
    }
    fn range(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from_ms: i64,
        _to_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        Ok(Vec::new())
    }
    fn last_open_time(&self, _symbol: &str, _timeframe: Timeframe) -> CoreResult<Option<i64>> {
        Ok(None)
    }
    fn tail(&self, _symbol: &str, _timeframe: Timeframe, _n: usize) -> CoreResult<Vec<Candle>> {
        Ok(Vec::new())
    }
    fn tail_until(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _until_ms: i64,
        _n: usize,
    ) -> CoreResult<Vec<Candle>> {
        Ok(Vec::new())
    }
    fn open_times_between(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from_ms: i64,
        _to_ms: i64,
    ) -> CoreResult<Vec<i64>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignalStore;

impl SignalStore for NoopSignalStore {
    fn save(&self, _signal: &Signal) -> CoreResult<()> {
        Ok(())
    }
    fn update_state(
        &self,
        _signal_id: &str,
        _state: SignalState,
        _close_time_ms: i64,
        _close_price: f64,
    ) -> CoreResult<()> {
        Ok(())
    }
    fn update_mae_mfe(&self, _signal_id: &str, _mae: f64, _mfe: f64) -> CoreResult<()> {
        Ok(())
    }
    fn load_active(&self) -> CoreResult<Vec<Signal>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreakStore;

impl StreakStore for NoopStreakStore {
    fn save(&self, _symbol: &str, _timeframe: Timeframe, _tracker: &StreakTracker) -> CoreResult<()> {
        Ok(())
    }
    fn load_all(&self) -> CoreResult<Vec<(SeriesKey, StreakTracker)>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpointStore;

impl CheckpointStore for NoopCheckpointStore {
    fn get(&self, _symbol: &str, _timeframe: Timeframe) -> CoreResult<Option<ProcessingCheckpoint>> {
        Ok(None)
    }
    fn upsert(&self, _checkpoint: &ProcessingCheckpoint) -> CoreResult<()> {
        Ok(())
    }
    fn mark_pending(&self, _symbol: &str, _timeframe: Timeframe) -> CoreResult<()> {
        Ok(())
    }
    fn load_pending(&self) -> CoreResult<Vec<ProcessingCheckpoint>> {
        Ok(Vec::new())
    }
}

//! Streaming indicator kernel.
//!
//! Every indicator updates incrementally bar-by-bar so live, replay and
//! backtest paths share one code path and produce identical values for
//! identical input order.

pub mod atr;
pub mod ema;
pub mod fib;
pub mod vwap;

use crate::candle::Candle;

pub use atr::Atr;
pub use ema::Ema;
pub use fib::{FibLevels, FibWindow};
pub use vwap::Vwap;

/// Fixed-capacity ring buffer for rolling-window computations.
#[derive(Debug, Clone)]
pub struct RingBuf {
    buf: Vec<f64>,
    pos: usize,
    len: usize,
    cap: usize,
}

impl RingBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            pos: 0,
            len: 0,
            cap: capacity,
        }
    }

    pub fn push(&mut self, val: f64) {
        self.buf[self.pos] = val;
        self.pos = (self.pos + 1) % self.cap;
        if self.len < self.cap {
            self.len += 1;
        }
    }

    pub fn full(&self) -> bool {
        self.len == self.cap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn min(&self) -> f64 {
        self.iter().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.iter().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Iterate oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.len < self.cap { 0 } else { self.pos };
        (0..self.len).map(move |i| self.buf[(start + i) % self.cap])
    }
}

/// Indicator values for one closed bar, handed to the signal logic.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IndicatorSnapshot {
    pub ema50: f64,
    pub atr9: f64,
    pub fib_382: f64,
    pub fib_500: f64,
    pub fib_618: f64,
    pub vwap: f64,
}

impl IndicatorSnapshot {
    pub fn levels(&self) -> [f64; 4] {
        [self.fib_382, self.fib_500, self.fib_618, self.vwap]
    }
}

/// Indicator state for one (symbol, timeframe) series.
///
/// `update` returns `None` until every component is warm: the EMA needs
/// `ema_period` bars, the ATR `atr_period`, the Fibonacci window
/// `fib_window`. With the default 50/9/9 configuration a snapshot first
/// appears on bar 50.
#[derive(Debug, Clone)]
pub struct IndicatorBank {
    ema: Ema,
    atr: Atr,
    fib: FibWindow,
    vwap: Vwap,
    session_epoch: u64,
    bar_count: usize,
}

impl IndicatorBank {
    pub fn new(ema_period: usize, atr_period: usize, fib_window: usize) -> Self {
        Self {
            ema: Ema::new(ema_period),
            atr: Atr::new(atr_period),
            fib: FibWindow::new(fib_window),
            vwap: Vwap::new(),
            session_epoch: 0,
            bar_count: 0,
        }
    }

    /// Advance the VWAP session epoch. Unused by the default (never-reset)
    /// session policy; exposed for session-anchored VWAP variants.
    pub fn advance_session(&mut self) {
        self.session_epoch += 1;
    }

    pub fn bar_count(&self) -> usize {
        self.bar_count
    }

    /// Feed one closed bar. Bars that fail validation are rejected without
    /// touching any component.
    pub fn update(&mut self, bar: &Candle) -> Option<IndicatorSnapshot> {
        if bar.validate().is_err() {
            tracing::warn!(
                symbol = %bar.symbol,
                timeframe = %bar.timeframe,
                open_time_ms = bar.open_time_ms,
                "rejecting bar with invalid numerics"
            );
            return None;
        }

        let ema50 = self.ema.update(bar.close);
        let atr9 = self.atr.update(bar.high, bar.low, bar.close);
        let fib = self.fib.update(bar.high, bar.low);
        let vwap = self
            .vwap
            .update(bar.high, bar.low, bar.close, bar.volume, self.session_epoch);
        self.bar_count += 1;

        let fib = fib?;
        if !(self.ema.is_warm() && self.atr.is_warm()) {
            return None;
        }

        Some(IndicatorSnapshot {
            ema50,
            atr9,
            fib_382: fib.fib_382,
            fib_500: fib.fib_500,
            fib_618: fib.fib_618,
            vwap,
        })
    }
}

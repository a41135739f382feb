//! Rolling ATR percentile tracker used by the signal quality filter.
//!
//! Keeps a bounded per-(symbol, timeframe) window of historical ATR values
//! and answers empirical-CDF queries (fraction of values <= query). The
//! window is large enough (10 000 by default) that the rolling percentile
//! converges to the full-history rank for stationary ATR distributions.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::candle::{SeriesKey, Timeframe};

pub const DEFAULT_MAX_HISTORY: usize = 10_000;
pub const DEFAULT_MIN_SAMPLES: usize = 200;

#[derive(Debug, Clone)]
pub struct AtrPercentileTracker {
    min_samples: usize,
    max_history: usize,
    history: FxHashMap<SeriesKey, VecDeque<f64>>,
}

fn is_valid(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl AtrPercentileTracker {
    pub fn new(min_samples: usize, max_history: usize) -> Self {
        Self {
            min_samples: min_samples.max(1),
            max_history: max_history.max(1),
            history: FxHashMap::default(),
        }
    }

    /// Append one ATR observation. NaN, infinities, zero and negatives are
    /// silently skipped — every stored element is finite and positive.
    pub fn update(&mut self, symbol: &str, timeframe: Timeframe, atr_value: f64) {
        if !is_valid(atr_value) {
            return;
        }
        let buf = self
            .history
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(|| VecDeque::with_capacity(self.max_history.min(1024)));
        if buf.len() == self.max_history {
            buf.pop_front();
        }
        buf.push_back(atr_value);
    }

    /// Empirical CDF of `atr_value` within its series history, or `None`
    /// while fewer than `min_samples` observations have been recorded.
    pub fn percentile(&self, symbol: &str, timeframe: Timeframe, atr_value: f64) -> Option<f64> {
        let buf = self.history.get(&(symbol.to_string(), timeframe))?;
        if buf.len() < self.min_samples {
            return None;
        }
        let below = buf.iter().filter(|&&x| x <= atr_value).count();
        Some(below as f64 / buf.len() as f64)
    }

    pub fn count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.history
            .get(&(symbol.to_string(), timeframe))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn is_ready(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.count(symbol, timeframe) >= self.min_samples
    }

    /// Startup warmup: ingest a historical slice in one pass. Invalid
    /// values are filtered; when the total exceeds `max_history` only the
    /// most recent observations are kept.
    pub fn bulk_load(&mut self, symbol: &str, timeframe: Timeframe, atr_values: &[f64]) {
        let clean: Vec<f64> = atr_values.iter().copied().filter(|v| is_valid(*v)).collect();
        let filtered = atr_values.len() - clean.len();

        let buf = self
            .history
            .entry((symbol.to_string(), timeframe))
            .or_insert_with(VecDeque::new);
        buf.extend(clean.iter());
        while buf.len() > self.max_history {
            buf.pop_front();
        }

        tracing::info!(
            symbol,
            timeframe = %timeframe,
            loaded = clean.len(),
            filtered,
            total = buf.len(),
            "ATR percentile warmup"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(min_samples: usize) -> AtrPercentileTracker {
        AtrPercentileTracker::new(min_samples, DEFAULT_MAX_HISTORY)
    }

    #[test]
    fn percentile_undefined_below_min_samples() {
        let mut t = tracker(200);
        for i in 0..199 {
            t.update("BTCUSDT", Timeframe::M5, 1.0 + i as f64);
        }
        assert_eq!(t.percentile("BTCUSDT", Timeframe::M5, 50.0), None);
        assert!(!t.is_ready("BTCUSDT", Timeframe::M5));

        // The 200th sample is the first defined query.
        t.update("BTCUSDT", Timeframe::M5, 200.0);
        assert!(t.is_ready("BTCUSDT", Timeframe::M5));
        let pct = t.percentile("BTCUSDT", Timeframe::M5, 200.0).unwrap();
        assert!((pct - 1.0).abs() < 1e-10);
    }

    #[test]
    fn percentile_is_empirical_cdf() {
        let mut t = tracker(4);
        for v in [1.0, 2.0, 3.0, 4.0] {
            t.update("ETHUSDT", Timeframe::M15, v);
        }
        assert_eq!(t.percentile("ETHUSDT", Timeframe::M15, 2.5), Some(0.5));
        assert_eq!(t.percentile("ETHUSDT", Timeframe::M15, 0.5), Some(0.0));
        // Ties count as <=.
        assert_eq!(t.percentile("ETHUSDT", Timeframe::M15, 3.0), Some(0.75));
    }

    #[test]
    fn invalid_values_are_skipped() {
        let mut t = tracker(1);
        t.update("BTCUSDT", Timeframe::M1, f64::NAN);
        t.update("BTCUSDT", Timeframe::M1, f64::INFINITY);
        t.update("BTCUSDT", Timeframe::M1, 0.0);
        t.update("BTCUSDT", Timeframe::M1, -3.0);
        assert_eq!(t.count("BTCUSDT", Timeframe::M1), 0);
    }

    #[test]
    fn ring_drops_oldest_when_full() {
        let mut t = AtrPercentileTracker::new(1, 3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            t.update("BTCUSDT", Timeframe::M1, v);
        }
        assert_eq!(t.count("BTCUSDT", Timeframe::M1), 3);
        // 1.0 is gone, so nothing is <= 1.5.
        assert_eq!(t.percentile("BTCUSDT", Timeframe::M1, 1.5), Some(0.0));
    }

    #[test]
    fn bulk_load_filters_and_caps() {
        let mut t = AtrPercentileTracker::new(2, 4);
        let values = vec![f64::NAN, 1.0, 2.0, -1.0, 3.0, 4.0, 5.0];
        t.bulk_load("SOLUSDT", Timeframe::M5, &values);
        // 5 valid values, capped at 4 most recent: [2,3,4,5].
        assert_eq!(t.count("SOLUSDT", Timeframe::M5), 4);
        assert_eq!(t.percentile("SOLUSDT", Timeframe::M5, 1.5), Some(0.0));
    }

    #[test]
    fn series_are_independent() {
        let mut t = tracker(1);
        t.update("BTCUSDT", Timeframe::M5, 1.0);
        t.update("BTCUSDT", Timeframe::M15, 100.0);
        assert_eq!(t.percentile("BTCUSDT", Timeframe::M5, 5.0), Some(1.0));
        assert_eq!(t.percentile("BTCUSDT", Timeframe::M15, 5.0), Some(0.0));
    }
}

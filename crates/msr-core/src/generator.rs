//! Retest-capture signal generation.
//!
//! Strategy logic (mirrors the validated Pine Script study):
//! - Uptrend (close > ema50) + touch of support + bullish reversal → SHORT
//! - Downtrend (close < ema50) + touch of resistance + bearish reversal → LONG
//!
//! TP/SL is "wide stop, narrow target": TP distance = ATR × tp_mult capped
//! by the bar extreme ± ATR, SL distance = ATR × sl_mult.
//!
//! Emission protocol: `evaluate` is pure and returns a gated candidate; the
//! caller persists it and only then calls `lock` — a candidate that fails
//! persistence never occupies the key. Rejected candidates touch neither
//! the streak book nor the lock set.

use rustc_hash::FxHashSet;

use crate::atr_tracker::AtrPercentileTracker;
use crate::candle::{Candle, SeriesKey, Timeframe};
use crate::config::{FilterTable, StrategyConfig};
use crate::error::{CoreError, CoreResult};
use crate::indicators::IndicatorSnapshot;
use crate::levels;
use crate::signal::{signal_id, Direction, Signal, SignalState};
use crate::streak::StreakBook;

/// Take-profit / stop-loss prices for a candidate entry at `entry`.
///
/// LONG:  tp = min(entry + tp_mult·atr, high + atr), sl = entry − sl_mult·atr
/// SHORT: tp = max(entry − tp_mult·atr, low − atr),  sl = entry + sl_mult·atr
pub fn price_tp_sl(
    cfg: &StrategyConfig,
    direction: Direction,
    entry: f64,
    atr: f64,
    high: f64,
    low: f64,
) -> (f64, f64) {
    let tp_distance = atr * cfg.tp_atr_mult;
    let sl_distance = atr * cfg.sl_atr_mult;
    match direction {
        Direction::Long => ((entry + tp_distance).min(high + atr), entry - sl_distance),
        Direction::Short => ((entry - tp_distance).max(low - atr), entry + sl_distance),
    }
}

pub struct SignalEngine {
    cfg: StrategyConfig,
    /// `None` = no filter table loaded, every candidate passes (legacy /
    /// backtest mode). `Some` = whitelist is mandatory.
    filters: Option<FilterTable>,
    /// Keys currently occupied by an ACTIVE signal.
    locks: FxHashSet<SeriesKey>,
}

impl SignalEngine {
    pub fn new(cfg: StrategyConfig, filters: Option<FilterTable>) -> Self {
        if let Some(table) = &filters {
            let enabled: Vec<String> = table
                .values()
                .filter(|f| f.enabled)
                .map(|f| {
                    format!(
                        "{} {} streak[{},{}] ATR>{:.0}%",
                        f.symbol,
                        f.timeframe,
                        f.streak_lo,
                        f.streak_hi,
                        f.atr_pct_threshold * 100.0
                    )
                })
                .collect();
            tracing::info!(filters = %enabled.join(", "), "signal filters enabled");
        }
        Self {
            cfg,
            filters,
            locks: FxHashSet::default(),
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }

    pub fn is_locked(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.locks.contains(&(symbol.to_string(), timeframe))
    }

    /// Acquire the per-key position lock after the signal persisted.
    /// A second ACTIVE signal on the same key is an invariant violation.
    pub fn lock(&mut self, symbol: &str, timeframe: Timeframe) -> CoreResult<()> {
        if !self.locks.insert((symbol.to_string(), timeframe)) {
            return Err(CoreError::Invariant(format!(
                "duplicate active signal for {symbol} {timeframe}"
            )));
        }
        Ok(())
    }

    /// Release the key when its signal leaves ACTIVE.
    pub fn release(&mut self, symbol: &str, timeframe: Timeframe) {
        if self.locks.remove(&(symbol.to_string(), timeframe)) {
            tracing::debug!(symbol, timeframe = %timeframe, "released position lock");
        }
    }

    /// Drop every lock. Used when a restore rebuilds the ACTIVE set from
    /// the signal store.
    pub fn clear_locks(&mut self) {
        self.locks.clear();
    }

    pub fn locked_keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.locks.iter()
    }

    /// Run retest detection for one closed bar. Returns a fully priced,
    /// filter-gated candidate, or `None`. Pure: no locks are taken and no
    /// streak advances here.
    pub fn evaluate(
        &self,
        bar: &Candle,
        prev: Option<&Candle>,
        snap: &IndicatorSnapshot,
        streaks: &StreakBook,
        atr_tracker: &AtrPercentileTracker,
    ) -> Option<Signal> {
        if !snap.atr9.is_finite() || snap.atr9 <= 0.0 {
            return None;
        }
        if self.is_locked(&bar.symbol, bar.timeframe) {
            return None;
        }

        let prev_low = prev.map_or(bar.low, |p| p.low);
        let prev_high = prev.map_or(bar.high, |p| p.high);

        let classified = levels::classify(bar.close, snap);
        let (nearest_support, nearest_resistance) = levels::nearest(bar.close, &classified);
        let (support_score, support_count) =
            levels::side_score(bar.close, &classified.supports, true);
        let (resistance_score, resistance_count) =
            levels::side_score(bar.close, &classified.resistances, false);

        let uptrend = bar.close > snap.ema50;
        let downtrend = bar.close < snap.ema50;

        // SHORT: price bounced up off support inside an uptrend and is
        // expected to retest it.
        let short = if uptrend
            && support_count >= 1
            && support_score >= self.cfg.score_threshold
            && bar.is_bullish()
        {
            nearest_support
                .filter(|&s| bar.low <= s || prev_low <= s)
                .map(|_| Direction::Short)
        } else {
            None
        };

        // LONG: mirror off resistance inside a downtrend.
        let long = if downtrend
            && resistance_count >= 1
            && resistance_score >= self.cfg.score_threshold
            && bar.is_bearish()
        {
            nearest_resistance
                .filter(|&r| bar.high >= r || prev_high >= r)
                .map(|_| Direction::Long)
        } else {
            None
        };

        let direction = match (short, long) {
            (Some(d), None) | (None, Some(d)) => d,
            (Some(_), Some(_)) => {
                // The ema50 trend test makes the sides mutually exclusive;
                // reaching this arm means the inputs are inconsistent.
                tracing::error!(
                    symbol = %bar.symbol,
                    timeframe = %bar.timeframe,
                    open_time_ms = bar.open_time_ms,
                    "both LONG and SHORT matched on one bar, emitting neither"
                );
                return None;
            }
            (None, None) => return None,
        };

        let entry = bar.close;
        let (tp, sl) = price_tp_sl(&self.cfg, direction, entry, snap.atr9, bar.high, bar.low);
        let streak_at_signal = streaks.current(&bar.symbol, bar.timeframe);

        let candidate = Signal {
            id: signal_id(&bar.symbol, bar.timeframe, bar.open_time_ms, direction),
            symbol: bar.symbol.clone(),
            timeframe: bar.timeframe,
            signal_time_ms: bar.open_time_ms,
            direction,
            entry,
            tp,
            sl,
            atr_at_signal: snap.atr9,
            streak_at_signal,
            state: SignalState::Active,
            mae_ratio: 0.0,
            mfe_ratio: 0.0,
            close_time_ms: None,
            close_price: None,
        };

        if !self.passes_filter(&candidate, atr_tracker) {
            return None;
        }

        tracing::info!(
            symbol = %candidate.symbol,
            timeframe = %candidate.timeframe,
            direction = %candidate.direction,
            entry = candidate.entry,
            tp = candidate.tp,
            sl = candidate.sl,
            atr = candidate.atr_at_signal,
            streak = candidate.streak_at_signal,
            "signal candidate"
        );
        Some(candidate)
    }

    fn passes_filter(&self, signal: &Signal, atr_tracker: &AtrPercentileTracker) -> bool {
        let table = match &self.filters {
            None => return true,
            Some(table) => table,
        };

        let fc = match table.get(&(signal.symbol.clone(), signal.timeframe)) {
            Some(fc) if fc.enabled => fc,
            _ => {
                tracing::debug!(
                    symbol = %signal.symbol,
                    timeframe = %signal.timeframe,
                    "filter reject: series not in portfolio"
                );
                return false;
            }
        };

        if signal.streak_at_signal < fc.streak_lo || signal.streak_at_signal > fc.streak_hi {
            tracing::debug!(
                symbol = %signal.symbol,
                timeframe = %signal.timeframe,
                streak = signal.streak_at_signal,
                lo = fc.streak_lo,
                hi = fc.streak_hi,
                "filter reject: streak outside range"
            );
            return false;
        }

        if fc.atr_pct_threshold > 0.0 {
            match atr_tracker.percentile(&signal.symbol, signal.timeframe, signal.atr_at_signal) {
                None => {
                    tracing::debug!(
                        symbol = %signal.symbol,
                        timeframe = %signal.timeframe,
                        "filter reject: ATR history insufficient"
                    );
                    return false;
                }
                Some(pct) if pct <= fc.atr_pct_threshold => {
                    tracing::debug!(
                        symbol = %signal.symbol,
                        timeframe = %signal.timeframe,
                        atr_pct = pct,
                        threshold = fc.atr_pct_threshold,
                        "filter reject: ATR percentile at or below threshold"
                    );
                    return false;
                }
                Some(_) => {}
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    const TF: Timeframe = Timeframe::M5;

    fn bar(o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: TF,
            open_time_ms: 1_700_000_100_000 / 300_000 * 300_000,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 3.0,
            closed: true,
        }
    }

    /// Snapshot matching the canonical short-retest setup: close 102 above
    /// ema50 99, clustered supports just below, ATR 10.
    fn short_setup_snap() -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema50: 99.0,
            atr9: 10.0,
            fib_382: 101.0,
            fib_500: 101.8,
            fib_618: 100.5,
            vwap: 90.0,
        }
    }

    fn short_setup_bars() -> (Candle, Candle) {
        let current = bar(100.0, 102.6, 99.9, 102.0); // bullish
        let mut prev = bar(101.5, 102.0, 101.0, 101.6);
        prev.open_time_ms -= TF.period_ms();
        (current, prev)
    }

    /// Variant whose current bar stays above every support level.
    fn no_touch_current() -> Candle {
        bar(101.95, 102.5, 101.9, 102.0)
    }

    fn engine() -> SignalEngine {
        SignalEngine::new(StrategyConfig::default(), None)
    }

    #[test]
    fn short_retest_emits_with_expected_prices() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let sig = engine()
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .expect("short signal");

        assert_eq!(sig.direction, Direction::Short);
        assert_eq!(sig.entry, 102.0);
        // tp = max(entry − 2·atr, low − atr) = max(82, 89.9) = 89.9
        assert!((sig.tp - 89.9).abs() < 1e-9);
        // sl = entry + 8.84·atr = 190.4
        assert!((sig.sl - 190.4).abs() < 1e-9);
        assert_eq!(sig.state, SignalState::Active);
        assert_eq!(sig.streak_at_signal, 0);
        assert_eq!(
            sig.id,
            signal_id("BTCUSDT", TF, current.open_time_ms, Direction::Short)
        );
    }

    #[test]
    fn long_mirror_emits() {
        // Downtrend, resistances above, bearish candle touching resistance.
        let current = bar(103.0, 103.2, 101.5, 102.0);
        let snap = IndicatorSnapshot {
            ema50: 105.0,
            atr9: 10.0,
            fib_382: 103.0,
            fib_500: 102.2,
            fib_618: 103.5,
            vwap: 110.0,
        };
        let sig = engine()
            .evaluate(&current, None, &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .expect("long signal");
        assert_eq!(sig.direction, Direction::Long);
        // tp = min(entry + 2·atr, high + atr) = min(122, 113.2) = 113.2
        assert!((sig.tp - 113.2).abs() < 1e-9);
        assert!((sig.sl - (102.0 - 88.4)).abs() < 1e-9);
    }

    #[test]
    fn bearish_candle_blocks_short() {
        let (_, prev) = short_setup_bars();
        let current = bar(102.5, 102.6, 101.9, 102.0); // bearish
        let snap = short_setup_snap();
        assert!(engine()
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .is_none());
    }

    #[test]
    fn no_touch_no_signal() {
        let current = no_touch_current();
        let mut prev = bar(101.95, 102.3, 101.85, 102.1);
        prev.open_time_ms -= TF.period_ms();
        let snap = short_setup_snap();
        // Neither low reaches the nearest support at 101.8.
        assert!(engine()
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .is_none());
    }

    #[test]
    fn prev_bar_touch_is_sufficient() {
        let (_, prev) = short_setup_bars();
        let current = no_touch_current();
        let snap = short_setup_snap();
        assert!(prev.low <= 101.8);
        assert!(engine()
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .is_some());
    }

    #[test]
    fn weak_score_blocks() {
        let (current, prev) = short_setup_bars();
        // Lone distant support: score well under 1.0.
        let snap = IndicatorSnapshot {
            ema50: 90.0,
            atr9: 10.0,
            fib_382: 92.0,
            fib_500: 130.0,
            fib_618: 131.0,
            vwap: 132.0,
        };
        assert!(engine()
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .is_none());
    }

    #[test]
    fn lock_blocks_second_emission() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let mut eng = engine();
        let tracker = AtrPercentileTracker::new(200, 10_000);
        let book = StreakBook::new();

        let first = eng.evaluate(&current, Some(&prev), &snap, &book, &tracker);
        assert!(first.is_some());
        eng.lock("BTCUSDT", TF).unwrap();

        // The very same setup on the next bar is suppressed by the lock.
        assert!(eng.evaluate(&current, Some(&prev), &snap, &book, &tracker).is_none());

        eng.release("BTCUSDT", TF);
        assert!(eng.evaluate(&current, Some(&prev), &snap, &book, &tracker).is_some());
    }

    #[test]
    fn double_lock_is_invariant_violation() {
        let mut eng = engine();
        eng.lock("BTCUSDT", TF).unwrap();
        assert!(matches!(
            eng.lock("BTCUSDT", TF),
            Err(CoreError::Invariant(_))
        ));
    }

    fn filtered_engine(threshold: f64) -> SignalEngine {
        let filter = FilterConfig {
            symbol: "BTCUSDT".to_string(),
            timeframe: TF,
            enabled: true,
            streak_lo: 0,
            streak_hi: 3,
            atr_pct_threshold: threshold,
            position_qty: 1.0,
        };
        let mut table = FilterTable::default();
        table.insert((filter.symbol.clone(), filter.timeframe), filter);
        SignalEngine::new(StrategyConfig::default(), Some(table))
    }

    /// Tracker whose percentile for atr=10.0 is exactly `pct`.
    fn tracker_with_percentile(pct: f64) -> AtrPercentileTracker {
        let mut t = AtrPercentileTracker::new(100, 10_000);
        let below = (pct * 100.0).round() as usize;
        for _ in 0..below {
            t.update("BTCUSDT", TF, 5.0);
        }
        for _ in below..100 {
            t.update("BTCUSDT", TF, 20.0);
        }
        t
    }

    #[test]
    fn low_atr_percentile_rejects() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let eng = filtered_engine(0.60);
        let tracker = tracker_with_percentile(0.59);
        assert!(eng
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &tracker)
            .is_none());
    }

    #[test]
    fn high_atr_percentile_passes() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let eng = filtered_engine(0.60);
        let tracker = tracker_with_percentile(0.61);
        assert!(eng
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &tracker)
            .is_some());
    }

    #[test]
    fn insufficient_history_rejects_when_threshold_set() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let eng = filtered_engine(0.60);
        let tracker = AtrPercentileTracker::new(200, 10_000); // empty
        assert!(eng
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &tracker)
            .is_none());
    }

    #[test]
    fn unlisted_series_rejects_when_table_loaded() {
        let (mut current, mut prev) = short_setup_bars();
        current.symbol = "DOGEUSDT".to_string();
        prev.symbol = "DOGEUSDT".to_string();
        let snap = short_setup_snap();
        let eng = filtered_engine(0.0);
        assert!(eng
            .evaluate(&current, Some(&prev), &snap, &StreakBook::new(), &AtrPercentileTracker::new(200, 10_000))
            .is_none());
    }

    #[test]
    fn streak_outside_range_rejects() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let eng = filtered_engine(0.0);
        let mut book = StreakBook::new();
        for _ in 0..4 {
            book.record("BTCUSDT", TF, crate::signal::OutcomeKind::Tp);
        }
        // streak 4 > streak_hi 3
        assert!(eng
            .evaluate(&current, Some(&prev), &snap, &book, &AtrPercentileTracker::new(200, 10_000))
            .is_none());
    }

    #[test]
    fn streak_is_stamped_at_emission() {
        let (current, prev) = short_setup_bars();
        let snap = short_setup_snap();
        let mut book = StreakBook::new();
        book.record("BTCUSDT", TF, crate::signal::OutcomeKind::Tp);
        book.record("BTCUSDT", TF, crate::signal::OutcomeKind::Tp);
        let sig = engine()
            .evaluate(&current, Some(&prev), &snap, &book, &AtrPercentileTracker::new(200, 10_000))
            .unwrap();
        assert_eq!(sig.streak_at_signal, 2);
    }
}

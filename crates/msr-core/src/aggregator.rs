//! 1-minute → higher-timeframe bar rollup.
//!
//! One subscription per symbol carries only 1m bars; 3m/5m/15m/30m are
//! derived locally, aligned to epoch period boundaries. Each (symbol,
//! timeframe) pair keeps a single open aggregation slot.

use rustc_hash::FxHashMap;

use crate::candle::{Candle, SeriesKey, Timeframe};

const ONE_MINUTE_MS: i64 = 60_000;

/// Open aggregation slot for one (symbol, timeframe).
#[derive(Debug, Clone, Copy)]
struct Slot {
    open_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl Slot {
    fn start(open_time_ms: i64, bar: &Candle) -> Self {
        Self {
            open_time_ms,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn merge(&mut self, bar: &Candle) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
    }

    fn into_candle(self, symbol: &str, timeframe: Timeframe) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe,
            open_time_ms: self.open_time_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            closed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandleAggregator {
    targets: Vec<Timeframe>,
    slots: FxHashMap<SeriesKey, Slot>,
    last_1m_open: FxHashMap<String, i64>,
    out_of_order_dropped: u64,
}

impl CandleAggregator {
    pub fn new(targets: &[Timeframe]) -> Self {
        Self {
            targets: targets
                .iter()
                .copied()
                .filter(|tf| *tf != Timeframe::M1)
                .collect(),
            slots: FxHashMap::default(),
            last_1m_open: FxHashMap::default(),
            out_of_order_dropped: 0,
        }
    }

    pub fn out_of_order_dropped(&self) -> u64 {
        self.out_of_order_dropped
    }

    /// Feed one closed 1m bar; returns every higher-timeframe bar it
    /// completes (at most one per target timeframe).
    ///
    /// A bar completes its slot either by reaching the period boundary, or
    /// — after a feed gap swallowed the boundary bar — by belonging to a
    /// later slot, in which case the stale slot is emitted as-is first.
    pub fn add_1m(&mut self, bar: &Candle) -> Vec<Candle> {
        debug_assert_eq!(bar.timeframe, Timeframe::M1);
        if !bar.closed || bar.timeframe != Timeframe::M1 {
            return Vec::new();
        }

        // Monotonic delivery only; backfill rewrites go through the store.
        if let Some(&last) = self.last_1m_open.get(&bar.symbol) {
            if bar.open_time_ms <= last {
                self.out_of_order_dropped += 1;
                tracing::warn!(
                    symbol = %bar.symbol,
                    open_time_ms = bar.open_time_ms,
                    last_seen_ms = last,
                    "dropping out-of-order 1m bar in aggregator"
                );
                return Vec::new();
            }
        }
        self.last_1m_open.insert(bar.symbol.clone(), bar.open_time_ms);

        let mut completed = Vec::new();
        for tf in self.targets.clone() {
            let period = tf.period_ms();
            let slot_open = bar.open_time_ms / period * period;
            let key = (bar.symbol.clone(), tf);

            use std::collections::hash_map::Entry;
            match self.slots.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    if slot.open_time_ms == slot_open {
                        slot.merge(bar);
                    } else {
                        // The boundary bar never arrived; flush what we have.
                        let stale = *slot;
                        completed.push(stale.into_candle(&bar.symbol, tf));
                        *slot = Slot::start(slot_open, bar);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Slot::start(slot_open, bar));
                }
            }

            if bar.open_time_ms + ONE_MINUTE_MS == slot_open + period {
                if let Some(slot) = self.slots.remove(&key) {
                    completed.push(slot.into_candle(&bar.symbol, tf));
                }
            }
        }
        completed
    }

    /// Seed open slots from persisted 1m history so the first live bar
    /// continues an in-progress period instead of starting a ragged one.
    /// `history` must be closed 1m bars in ascending open-time order; bars
    /// of already-completed periods are ignored.
    pub fn seed_history(&mut self, symbol: &str, history: &[Candle]) {
        let last = match history.last() {
            Some(bar) => bar,
            None => return,
        };

        for tf in self.targets.clone() {
            let period = tf.period_ms();
            self.slots.remove(&(symbol.to_string(), tf));

            // Last bar closed its period: nothing is in progress.
            if (last.open_time_ms + ONE_MINUTE_MS) % period == 0 {
                continue;
            }

            let slot_open = last.open_time_ms / period * period;
            let mut slot: Option<Slot> = None;
            for bar in history.iter().filter(|b| b.open_time_ms >= slot_open) {
                match slot.as_mut() {
                    Some(s) => s.merge(bar),
                    None => slot = Some(Slot::start(slot_open, bar)),
                }
            }
            if let Some(slot) = slot {
                self.slots.insert((symbol.to_string(), tf), slot);
            }
        }
        self.last_1m_open
            .insert(symbol.to_string(), last.open_time_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar_1m(t: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            open_time_ms: t,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            closed: true,
        }
    }

    #[test]
    fn five_bars_roll_into_one_5m() {
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        let mut out = Vec::new();
        // open times 300s..540s, i.e. one aligned 5m period.
        for (i, t) in [300_000i64, 360_000, 420_000, 480_000, 540_000].iter().enumerate() {
            let p = 100.0 + i as f64;
            out = agg.add_1m(&bar_1m(*t, p, p + 2.0, p - 2.0, p + 1.0, 10.0));
        }
        assert_eq!(out.len(), 1);
        let c = &out[0];
        assert_eq!(c.timeframe, Timeframe::M5);
        assert_eq!(c.open_time_ms, 300_000);
        assert_eq!(c.open_time_ms % Timeframe::M5.period_ms(), 0);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 106.0);
        assert_eq!(c.low, 98.0);
        assert_eq!(c.close, 105.0);
        assert_eq!(c.volume, 50.0);
        assert!(c.closed);
    }

    #[test]
    fn nothing_emitted_mid_period() {
        let mut agg = CandleAggregator::new(&[Timeframe::M15]);
        for t in [0i64, 60_000, 120_000] {
            assert!(agg.add_1m(&bar_1m(t, 1.0, 2.0, 0.5, 1.5, 1.0)).is_empty());
        }
    }

    #[test]
    fn multiple_targets_complete_on_shared_boundary() {
        let mut agg = CandleAggregator::new(&Timeframe::AGGREGATED);
        let mut emitted = Vec::new();
        for i in 0..30i64 {
            emitted.extend(agg.add_1m(&bar_1m(i * 60_000, 1.0, 2.0, 0.5, 1.5, 1.0)));
        }
        // 30 minutes: 10× 3m, 6× 5m, 2× 15m, 1× 30m.
        let count = |tf: Timeframe| emitted.iter().filter(|c| c.timeframe == tf).count();
        assert_eq!(count(Timeframe::M3), 10);
        assert_eq!(count(Timeframe::M5), 6);
        assert_eq!(count(Timeframe::M15), 2);
        assert_eq!(count(Timeframe::M30), 1);
        for c in &emitted {
            assert_eq!(c.open_time_ms % c.timeframe.period_ms(), 0);
        }
    }

    #[test]
    fn gap_flushes_stale_slot() {
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        agg.add_1m(&bar_1m(0, 1.0, 2.0, 0.5, 1.5, 1.0));
        agg.add_1m(&bar_1m(60_000, 1.5, 2.5, 1.0, 2.0, 1.0));
        // Minutes 2-4 are missing; the next bar lands in the following
        // period and flushes the partial slot.
        let out = agg.add_1m(&bar_1m(360_000, 3.0, 4.0, 2.5, 3.5, 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time_ms, 0);
        assert_eq!(out[0].volume, 2.0);
    }

    #[test]
    fn out_of_order_bar_is_dropped() {
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        agg.add_1m(&bar_1m(120_000, 1.0, 2.0, 0.5, 1.5, 1.0));
        let out = agg.add_1m(&bar_1m(60_000, 9.0, 9.0, 9.0, 9.0, 9.0));
        assert!(out.is_empty());
        assert_eq!(agg.out_of_order_dropped(), 1);
    }

    #[test]
    fn seed_history_resumes_open_period() {
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        // History ends two minutes into a 5m period.
        let history = vec![
            bar_1m(240_000, 1.0, 2.0, 0.5, 1.5, 1.0), // previous period
            bar_1m(300_000, 2.0, 3.0, 1.5, 2.5, 1.0),
            bar_1m(360_000, 2.5, 3.5, 2.0, 3.0, 1.0),
        ];
        agg.seed_history("BTCUSDT", &history);

        for t in [420_000i64, 480_000] {
            assert!(agg.add_1m(&bar_1m(t, 3.0, 4.0, 2.5, 3.5, 1.0)).is_empty());
        }
        let out = agg.add_1m(&bar_1m(540_000, 3.5, 4.5, 3.0, 4.0, 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time_ms, 300_000);
        assert_eq!(out[0].open, 2.0);
        assert_eq!(out[0].close, 4.0);
        assert_eq!(out[0].volume, 5.0);
    }

    #[test]
    fn seed_history_on_boundary_leaves_slot_empty() {
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        let history = vec![
            bar_1m(300_000, 2.0, 3.0, 1.5, 2.5, 1.0),
            bar_1m(360_000, 2.5, 3.5, 2.0, 3.0, 1.0),
            bar_1m(420_000, 3.0, 4.0, 2.5, 3.5, 1.0),
            bar_1m(480_000, 3.0, 4.0, 2.5, 3.5, 1.0),
            bar_1m(540_000, 3.5, 4.5, 3.0, 4.0, 1.0), // closes the period
        ];
        agg.seed_history("BTCUSDT", &history);
        // Next period aggregates only live bars.
        for t in [600_000i64, 660_000, 720_000, 780_000] {
            assert!(agg.add_1m(&bar_1m(t, 5.0, 6.0, 4.5, 5.5, 1.0)).is_empty());
        }
        let out = agg.add_1m(&bar_1m(840_000, 5.5, 6.5, 5.0, 6.0, 1.0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time_ms, 600_000);
        assert_eq!(out[0].volume, 5.0);
    }

    #[test]
    fn aggregator_round_trip() {
        // Aligned 1m bars re-aggregated to 5m equal direct 5m construction.
        let mut agg = CandleAggregator::new(&[Timeframe::M5]);
        let mut emitted = Vec::new();
        let mut expected = Vec::new();
        for p in 0..4i64 {
            let base = p * 300_000;
            let mut high = f64::NEG_INFINITY;
            let mut low = f64::INFINITY;
            let mut vol = 0.0;
            for m in 0..5i64 {
                let px = 100.0 + (p * 5 + m) as f64;
                let b = bar_1m(base + m * 60_000, px, px + 1.0, px - 1.0, px + 0.5, 2.0);
                high = high.max(b.high);
                low = low.min(b.low);
                vol += b.volume;
                emitted.extend(agg.add_1m(&b));
            }
            expected.push((base, 100.0 + (p * 5) as f64, high, low, 100.0 + (p * 5 + 4) as f64 + 0.5, vol));
        }
        assert_eq!(emitted.len(), expected.len());
        for (c, (t, o, h, l, cl, v)) in emitted.iter().zip(expected) {
            assert_eq!(c.open_time_ms, t);
            assert_eq!(c.open, o);
            assert_eq!(c.high, h);
            assert_eq!(c.low, l);
            assert_eq!(c.close, cl);
            assert_eq!(c.volume, v);
        }
    }
}

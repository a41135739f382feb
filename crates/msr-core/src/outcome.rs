//! Outcome tracking for ACTIVE signals.
//!
//! Two input paths share the same resolution rules ([`Signal`] methods):
//! the tick path compares each traded price against TP/SL, the bar path
//! (replay and the per-bar live check) evaluates a closed 1m bar's
//! extremes with the pessimistic both-touched ⇒ SL rule.
//!
//! The tracker is pure state: it returns closed signals and throttled
//! MAE/MFE updates, and the runtime engine turns those into store writes,
//! streak records, lock releases and bus events.

use rustc_hash::FxHashMap;

use crate::candle::{Candle, Timeframe, Trade};
use crate::signal::{Signal, SignalState};

/// Throttle window for MAE/MFE publication, per signal.
pub const MAE_PUBLISH_INTERVAL_MS: i64 = 1_000;

/// A throttled excursion update ready for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct MaeUpdate {
    pub id: String,
    pub mae_ratio: f64,
    pub mfe_ratio: f64,
}

/// What one input event did to the active set.
#[derive(Debug, Clone, Default)]
pub struct TrackerOutput {
    /// Signals that just left ACTIVE, in resolution order. Each carries
    /// its final state, close time and close price.
    pub closed: Vec<Signal>,
    pub mae_updates: Vec<MaeUpdate>,
}

impl TrackerOutput {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.mae_updates.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct OutcomeTracker {
    /// ACTIVE signals grouped by symbol (a symbol can hold one signal per
    /// timeframe).
    active: FxHashMap<String, Vec<Signal>>,
    last_publish_ms: FxHashMap<String, i64>,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a freshly emitted (already persisted) signal.
    pub fn track(&mut self, signal: Signal) {
        debug_assert_eq!(signal.state, SignalState::Active);
        self.active.entry(signal.symbol.clone()).or_default().push(signal);
    }

    pub fn active_count(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }

    pub fn active_signals(&self) -> impl Iterator<Item = &Signal> {
        self.active.values().flatten()
    }

    pub fn has_active(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.active
            .get(symbol)
            .map(|sigs| sigs.iter().any(|s| s.timeframe == timeframe))
            .unwrap_or(false)
    }

    /// Tick path: one aggregated trade.
    pub fn on_trade(&mut self, trade: &Trade) -> TrackerOutput {
        let mut out = TrackerOutput::default();
        let signals = match self.active.get_mut(&trade.symbol) {
            Some(signals) => signals,
            None => return out,
        };

        let mut closed_idx = Vec::new();
        for (i, sig) in signals.iter_mut().enumerate() {
            if sig.check_outcome_tick(trade.price, trade.timestamp_ms).is_some() {
                out.closed.push(sig.clone());
                closed_idx.push(i);
                continue;
            }
            let moved = sig.update_excursions(trade.price);
            if moved {
                Self::maybe_publish(
                    &mut self.last_publish_ms,
                    sig,
                    trade.timestamp_ms,
                    &mut out.mae_updates,
                );
            }
        }
        Self::remove_closed(signals, &closed_idx, &mut self.last_publish_ms);
        if signals.is_empty() {
            self.active.remove(&trade.symbol);
        }
        out
    }

    /// Bar path: one closed 1m bar. Adverse extreme is folded in before
    /// the favorable one so MAE is never understated.
    pub fn on_bar_1m(&mut self, bar: &Candle) -> TrackerOutput {
        debug_assert_eq!(bar.timeframe, Timeframe::M1);
        let mut out = TrackerOutput::default();
        let signals = match self.active.get_mut(&bar.symbol) {
            Some(signals) => signals,
            None => return out,
        };

        let now_ms = bar.close_time_ms();
        let mut closed_idx = Vec::new();
        for (i, sig) in signals.iter_mut().enumerate() {
            let (adverse, favorable) = match sig.direction {
                crate::signal::Direction::Long => (bar.low, bar.high),
                crate::signal::Direction::Short => (bar.high, bar.low),
            };
            let moved_a = sig.update_excursions(adverse);
            let moved_f = sig.update_excursions(favorable);

            if sig.check_outcome_bar(bar).is_some() {
                out.closed.push(sig.clone());
                closed_idx.push(i);
                continue;
            }
            if moved_a || moved_f {
                Self::maybe_publish(&mut self.last_publish_ms, sig, now_ms, &mut out.mae_updates);
            }
        }
        Self::remove_closed(signals, &closed_idx, &mut self.last_publish_ms);
        if signals.is_empty() {
            self.active.remove(&bar.symbol);
        }
        out
    }

    /// Final MAE/MFE values of every still-active signal, for the shutdown
    /// flush.
    pub fn drain_excursions(&self) -> Vec<MaeUpdate> {
        self.active_signals()
            .map(|s| MaeUpdate {
                id: s.id.clone(),
                mae_ratio: s.mae_ratio,
                mfe_ratio: s.mfe_ratio,
            })
            .collect()
    }

    fn maybe_publish(
        last_publish_ms: &mut FxHashMap<String, i64>,
        sig: &Signal,
        now_ms: i64,
        updates: &mut Vec<MaeUpdate>,
    ) {
        let last = last_publish_ms.get(&sig.id).copied();
        if last.map_or(true, |t| now_ms - t >= MAE_PUBLISH_INTERVAL_MS) {
            last_publish_ms.insert(sig.id.clone(), now_ms);
            updates.push(MaeUpdate {
                id: sig.id.clone(),
                mae_ratio: sig.mae_ratio,
                mfe_ratio: sig.mfe_ratio,
            });
        }
    }

    fn remove_closed(
        signals: &mut Vec<Signal>,
        closed_idx: &[usize],
        last_publish_ms: &mut FxHashMap<String, i64>,
    ) {
        for &i in closed_idx.iter().rev() {
            let sig = signals.remove(i);
            last_publish_ms.remove(&sig.id);
        }
    }
}

//! The serialized core engine.
//!
//! One task owns every piece of mutable strategy state — indicator banks,
//! aggregator slots, ATR history, streak book, position locks and the
//! ACTIVE-signal set — and processes closed bars and trades strictly in
//! arrival order. Replay and live ingestion call the same handlers, which
//! is what makes a restart behave as if the process never stopped.
//!
//! Per closed 1m bar the order is fixed: bar-path outcome check on ACTIVE
//! signals → 1m signal generation → aggregator emission → per-higher-
//! timeframe signal generation. A signal closed on bar *t* therefore
//! contributes to the streak stamped on any signal emitted on that same
//! bar.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use msr_core::aggregator::CandleAggregator;
use msr_core::atr_tracker::AtrPercentileTracker;
use msr_core::candle::{Candle, SeriesKey, Timeframe, Trade};
use msr_core::config::{FilterTable, TradingConfig};
use msr_core::error::{CoreError, CoreResult};
use msr_core::generator::SignalEngine;
use msr_core::indicators::{Atr, IndicatorBank};
use msr_core::outcome::{OutcomeTracker, TrackerOutput};
use msr_core::ports::{BarStore, CheckpointStore, EngineEvent, SignalStore, StreakStore};
use msr_core::signal::{OutcomeKind, Signal, SignalState};
use msr_core::streak::StreakBook;

use crate::bus::EventBus;

/// The collaborator stores the engine writes through.
#[derive(Clone)]
pub struct EngineStores {
    pub bars: Arc<dyn BarStore>,
    pub signals: Arc<dyn SignalStore>,
    pub streaks: Arc<dyn StreakStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

struct SeriesState {
    bank: IndicatorBank,
    prev: Option<Candle>,
    last: Option<Candle>,
}

pub struct CoreEngine {
    cfg: TradingConfig,
    stores: EngineStores,
    bus: EventBus,

    series: FxHashMap<SeriesKey, SeriesState>,
    aggregator: CandleAggregator,
    atr_tracker: AtrPercentileTracker,
    streaks: StreakBook,
    generator: SignalEngine,
    outcomes: OutcomeTracker,

    invalid_bars_dropped: u64,
}

impl CoreEngine {
    /// `filters = None` disables the quality gate (legacy/backtest mode);
    /// the live binary passes the resolved portfolio table.
    pub fn new(
        cfg: TradingConfig,
        filters: Option<FilterTable>,
        stores: EngineStores,
        bus: EventBus,
    ) -> Self {
        let aggregated: Vec<Timeframe> = cfg
            .timeframes
            .iter()
            .copied()
            .filter(|tf| *tf != Timeframe::M1)
            .collect();
        Self {
            aggregator: CandleAggregator::new(&aggregated),
            atr_tracker: AtrPercentileTracker::new(
                cfg.atr_tracker.min_samples,
                cfg.atr_tracker.max_history,
            ),
            streaks: StreakBook::new(),
            generator: SignalEngine::new(cfg.strategy.clone(), filters),
            outcomes: OutcomeTracker::new(),
            series: FxHashMap::default(),
            invalid_bars_dropped: 0,
            cfg,
            stores,
            bus,
        }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.cfg
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub fn active_signal_count(&self) -> usize {
        self.outcomes.active_count()
    }

    pub fn streak_book(&self) -> &StreakBook {
        &self.streaks
    }

    pub fn invalid_bars_dropped(&self) -> u64 {
        self.invalid_bars_dropped
    }

    pub fn aggregator_out_of_order_dropped(&self) -> u64 {
        self.aggregator.out_of_order_dropped()
    }

    pub fn is_locked(&self, symbol: &str, timeframe: Timeframe) -> bool {
        self.generator.is_locked(symbol, timeframe)
    }

    // -----------------------------------------------------------------
    // Restore (pipeline RESTORE phase)
    // -----------------------------------------------------------------

    /// Rebuild in-memory state from the stores: streak book, ACTIVE
    /// signals (with their position locks), indicator banks, aggregator
    /// slots and the ATR percentile warmup. Emits no signals.
    ///
    /// State is rebuilt only up to each symbol's checkpoint — the bars
    /// past it belong to REPLAY, which will feed them through the normal
    /// closed-bar handler.
    pub fn restore(&mut self) -> CoreResult<()> {
        // A restore after a disconnect rebuilds from the stores; state
        // carried over from the previous session would double-track
        // signals and double-acquire locks.
        let aggregated: Vec<Timeframe> = self
            .cfg
            .timeframes
            .iter()
            .copied()
            .filter(|tf| *tf != Timeframe::M1)
            .collect();
        self.aggregator = CandleAggregator::new(&aggregated);
        self.series.clear();
        self.outcomes = OutcomeTracker::new();
        self.generator.clear_locks();
        self.atr_tracker = AtrPercentileTracker::new(
            self.cfg.atr_tracker.min_samples,
            self.cfg.atr_tracker.max_history,
        );

        self.streaks = StreakBook::from_entries(self.stores.streaks.load_all()?);
        tracing::info!(streaks = self.streaks.len(), "restored streak trackers");

        let active = self.stores.signals.load_active()?;
        for signal in active {
            self.generator.lock(&signal.symbol, signal.timeframe)?;
            self.outcomes.track(signal);
        }
        tracing::info!(active = self.outcomes.active_count(), "restored active signals");

        let symbols = self.cfg.symbols.clone();
        let timeframes = self.cfg.timeframes.clone();
        for symbol in &symbols {
            let cutoff_ms = self
                .stores
                .checkpoints
                .get(symbol, Timeframe::M1)?
                .map(|cp| cp.last_processed_ms)
                .unwrap_or(i64::MAX);

            for &tf in &timeframes {
                self.restore_series(symbol, tf, cutoff_ms)?;
            }
            let seed = self.stores.bars.tail_until(
                symbol,
                Timeframe::M1,
                cutoff_ms,
                Timeframe::M30.minutes() as usize,
            )?;
            self.aggregator.seed_history(symbol, &seed);
        }
        Ok(())
    }

    /// Seed one series: feed `restore_bars` persisted bars through a fresh
    /// indicator bank and bulk-load the ATR tracker from a longer window.
    fn restore_series(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        cutoff_ms: i64,
    ) -> CoreResult<()> {
        let history = self.stores.bars.tail_until(
            symbol,
            timeframe,
            cutoff_ms,
            self.cfg.ingestion.restore_bars,
        )?;

        let mut state = self.new_series_state();
        for bar in &history {
            state.bank.update(bar);
            state.prev = state.last.take();
            state.last = Some(bar.clone());
        }
        if !history.is_empty() {
            tracing::info!(symbol, timeframe = %timeframe, bars = history.len(), "restored indicator bank");
        }
        self.series.insert((symbol.to_string(), timeframe), state);

        // ATR warmup over a longer window, recomputed from persisted bars.
        let warmup = self.stores.bars.tail_until(
            symbol,
            timeframe,
            cutoff_ms,
            self.cfg.atr_tracker.warmup_bars,
        )?;
        if warmup.len() >= self.cfg.strategy.atr_period {
            let mut atr = Atr::new(self.cfg.strategy.atr_period);
            let mut values = Vec::with_capacity(warmup.len());
            for bar in &warmup {
                let v = atr.update(bar.high, bar.low, bar.close);
                if atr.is_warm() {
                    values.push(v);
                }
            }
            self.atr_tracker.bulk_load(symbol, timeframe, &values);
        }
        Ok(())
    }

    fn new_series_state(&self) -> SeriesState {
        SeriesState {
            bank: IndicatorBank::new(
                self.cfg.strategy.ema_period,
                self.cfg.strategy.atr_period,
                self.cfg.strategy.fib_window,
            ),
            prev: None,
            last: None,
        }
    }

    // -----------------------------------------------------------------
    // Closed-bar handler (shared by REPLAY, CUTOVER and LIVE)
    // -----------------------------------------------------------------

    pub fn handle_closed_1m(&mut self, bar: &Candle) -> CoreResult<()> {
        debug_assert_eq!(bar.timeframe, Timeframe::M1);
        if let Err(e) = bar.validate() {
            self.invalid_bars_dropped += 1;
            tracing::warn!(error = %e, "dropping invalid 1m bar");
            return Ok(());
        }

        // 1. Bar-path outcome check on ACTIVE signals, before any
        //    emission this bar.
        let out = self.outcomes.on_bar_1m(bar);
        self.apply_tracker_output(out)?;

        // 2. Persist and process the 1m bar itself.
        self.persist_bar(bar);
        self.process_series_bar(bar)?;

        // 3. Aggregate, then process every completed higher-TF bar.
        let completed = self.aggregator.add_1m(bar);
        for agg in &completed {
            self.persist_bar(agg);
            self.process_series_bar(agg)?;
        }
        Ok(())
    }

    pub fn handle_trade(&mut self, trade: &Trade) -> CoreResult<()> {
        if let Err(e) = trade.validate() {
            tracing::warn!(error = %e, "dropping invalid trade");
            return Ok(());
        }
        let out = self.outcomes.on_trade(trade);
        self.apply_tracker_output(out)
    }

    /// Final MAE/MFE persistence for still-active signals (shutdown).
    pub fn flush_excursions(&self) {
        for upd in self.outcomes.drain_excursions() {
            if let Err(e) = self
                .stores
                .signals
                .update_mae_mfe(&upd.id, upd.mae_ratio, upd.mfe_ratio)
            {
                tracing::warn!(id = %upd.id, error = %e, "MAE/MFE flush failed");
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    /// Bar persistence failures are non-fatal: the row is repaired by the
    /// next upsert or by backfill after a restart.
    fn persist_bar(&self, bar: &Candle) {
        if let Err(e) = self.stores.bars.upsert(bar) {
            tracing::warn!(
                symbol = %bar.symbol,
                timeframe = %bar.timeframe,
                error = %e,
                "bar upsert failed"
            );
        }
    }

    fn process_series_bar(&mut self, bar: &Candle) -> CoreResult<()> {
        let key = bar.key();
        if !self.series.contains_key(&key) {
            let fresh = self.new_series_state();
            self.series.insert(key.clone(), fresh);
        }
        let state = self.series.get_mut(&key).expect("series just inserted");

        let snap = state.bank.update(bar);
        let prev = state.prev.clone();
        state.prev = state.last.take();
        state.last = Some(bar.clone());

        let snap = match snap {
            Some(snap) => snap,
            None => return Ok(()), // still warming up
        };

        // Every closed bar feeds the percentile distribution, locked or
        // filtered bars included, so the empirical CDF stays unbiased.
        self.atr_tracker
            .update(&bar.symbol, bar.timeframe, snap.atr9);

        let candidate =
            self.generator
                .evaluate(bar, prev.as_ref(), &snap, &self.streaks, &self.atr_tracker);
        if let Some(signal) = candidate {
            self.emit_signal(signal)?;
        }
        Ok(())
    }

    /// Persist-then-lock emission. A persistence failure abandons this
    /// signal only: the key stays unlocked and the engine keeps running.
    fn emit_signal(&mut self, signal: Signal) -> CoreResult<()> {
        if let Err(e) = self.stores.signals.save(&signal) {
            tracing::error!(
                id = %signal.id,
                error = %e,
                "failed to persist signal, it will not be tracked"
            );
            return Ok(());
        }
        self.generator.lock(&signal.symbol, signal.timeframe)?;
        self.outcomes.track(signal.clone());
        tracing::info!(
            id = %signal.id,
            direction = %signal.direction,
            entry = signal.entry,
            tp = signal.tp,
            sl = signal.sl,
            "signal emitted"
        );
        self.bus.publish(EngineEvent::SignalEmitted(signal));
        Ok(())
    }

    fn apply_tracker_output(&mut self, out: TrackerOutput) -> CoreResult<()> {
        for closed in out.closed {
            self.finish_signal(closed)?;
        }
        for upd in out.mae_updates {
            if let Err(e) = self
                .stores
                .signals
                .update_mae_mfe(&upd.id, upd.mae_ratio, upd.mfe_ratio)
            {
                tracing::warn!(id = %upd.id, error = %e, "MAE/MFE update failed");
            }
            self.bus.publish(EngineEvent::SignalMaeUpdated {
                id: upd.id,
                mae_ratio: upd.mae_ratio,
                mfe_ratio: upd.mfe_ratio,
            });
        }
        Ok(())
    }

    /// Outcome sequence: persist the closed state, advance and persist the
    /// streak, release the position lock, then publish. Observers see
    /// exactly one closed event per signal.
    fn finish_signal(&mut self, signal: Signal) -> CoreResult<()> {
        let kind = match signal.state {
            SignalState::Tp => OutcomeKind::Tp,
            SignalState::Sl => OutcomeKind::Sl,
            SignalState::Active => {
                return Err(CoreError::Invariant(format!(
                    "outcome tracker closed signal {} without a terminal state",
                    signal.id
                )))
            }
        };
        let close_time_ms = signal.close_time_ms.unwrap_or(signal.signal_time_ms);
        let close_price = signal.close_price.unwrap_or(signal.entry);

        if let Err(e) =
            self.stores
                .signals
                .update_state(&signal.id, signal.state, close_time_ms, close_price)
        {
            tracing::warn!(id = %signal.id, error = %e, "signal close persist failed");
        }
        // Persist best-effort final excursions alongside the close.
        if let Err(e) =
            self.stores
                .signals
                .update_mae_mfe(&signal.id, signal.mae_ratio, signal.mfe_ratio)
        {
            tracing::warn!(id = %signal.id, error = %e, "final MAE/MFE persist failed");
        }

        let tracker = self.streaks.record(&signal.symbol, signal.timeframe, kind);
        if let Err(e) = self
            .stores
            .streaks
            .save(&signal.symbol, signal.timeframe, &tracker)
        {
            tracing::warn!(
                symbol = %signal.symbol,
                timeframe = %signal.timeframe,
                error = %e,
                "streak persist failed"
            );
        }

        self.generator.release(&signal.symbol, signal.timeframe);

        tracing::info!(
            id = %signal.id,
            state = signal.state.as_str(),
            close_price,
            streak = tracker.current_streak,
            "signal closed"
        );
        self.bus.publish(EngineEvent::SignalClosed {
            id: signal.id,
            state: signal.state,
            close_time_ms,
            close_price,
        });
        Ok(())
    }
}

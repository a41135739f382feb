//! Per-(symbol, timeframe) win/loss streak state.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::candle::{SeriesKey, Timeframe};
use crate::signal::OutcomeKind;

/// Signed streak with lifetime counters. Positive = consecutive TPs,
/// negative = consecutive SLs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakTracker {
    pub current_streak: i32,
    pub total_wins: u32,
    pub total_losses: u32,
}

impl StreakTracker {
    pub fn record_outcome(&mut self, outcome: OutcomeKind) {
        match outcome {
            OutcomeKind::Tp => {
                self.total_wins += 1;
                if self.current_streak >= 0 {
                    self.current_streak += 1;
                } else {
                    self.current_streak = 1;
                }
            }
            OutcomeKind::Sl => {
                self.total_losses += 1;
                if self.current_streak <= 0 {
                    self.current_streak -= 1;
                } else {
                    self.current_streak = -1;
                }
            }
        }
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.total_wins + self.total_losses;
        if total == 0 {
            return 0.0;
        }
        self.total_wins as f64 / total as f64
    }
}

/// All streak trackers, keyed by series. Advanced only when a signal
/// transitions out of ACTIVE; filtered-out candidates never touch it.
#[derive(Debug, Clone, Default)]
pub struct StreakBook {
    trackers: FxHashMap<SeriesKey, StreakTracker>,
}

impl StreakBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the book from persisted state at startup.
    pub fn from_entries(entries: impl IntoIterator<Item = (SeriesKey, StreakTracker)>) -> Self {
        Self {
            trackers: entries.into_iter().collect(),
        }
    }

    /// Current signed streak for the series (0 when no history).
    pub fn current(&self, symbol: &str, timeframe: Timeframe) -> i32 {
        self.trackers
            .get(&(symbol.to_string(), timeframe))
            .map(|t| t.current_streak)
            .unwrap_or(0)
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> StreakTracker {
        self.trackers
            .get(&(symbol.to_string(), timeframe))
            .copied()
            .unwrap_or_default()
    }

    /// Record one outcome and return the updated tracker for persistence.
    pub fn record(&mut self, symbol: &str, timeframe: Timeframe, outcome: OutcomeKind) -> StreakTracker {
        let tracker = self
            .trackers
            .entry((symbol.to_string(), timeframe))
            .or_default();
        tracker.record_outcome(outcome);
        *tracker
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesKey, &StreakTracker)> {
        self.trackers.iter()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

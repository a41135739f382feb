//! Signal records: lifecycle state, deterministic ids, excursion tracking
//! and TP/SL touch evaluation for both the tick path and the bar path.

use serde::{Deserialize, Serialize};

use crate::candle::{Candle, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" => Ok(Direction::Long),
            "SHORT" => Ok(Direction::Short),
            other => Err(crate::CoreError::Config(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalState {
    Active,
    Tp,
    Sl,
}

impl SignalState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalState::Active => "ACTIVE",
            SignalState::Tp => "TP",
            SignalState::Sl => "SL",
        }
    }
}

impl std::str::FromStr for SignalState {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(SignalState::Active),
            "TP" => Ok(SignalState::Tp),
            "SL" => Ok(SignalState::Sl),
            other => Err(crate::CoreError::Config(format!(
                "unknown signal state '{other}'"
            ))),
        }
    }
}

/// Terminal outcome of a closed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeKind {
    Tp,
    Sl,
}

impl From<OutcomeKind> for SignalState {
    fn from(kind: OutcomeKind) -> Self {
        match kind {
            OutcomeKind::Tp => SignalState::Tp,
            OutcomeKind::Sl => SignalState::Sl,
        }
    }
}

/// Deterministic signal id. Derived purely from the emitting bar so that
/// re-replaying the same window after a crash assigns the same ids and the
/// signal-store upsert stays idempotent.
pub fn signal_id(symbol: &str, timeframe: Timeframe, open_time_ms: i64, direction: Direction) -> String {
    format!("{symbol}-{}-{open_time_ms}-{}", timeframe.as_str(), direction.as_str())
}

/// One emitted trading signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub signal_time_ms: i64,
    pub direction: Direction,
    pub entry: f64,
    pub tp: f64,
    pub sl: f64,
    pub atr_at_signal: f64,
    pub streak_at_signal: i32,
    pub state: SignalState,
    pub mae_ratio: f64,
    pub mfe_ratio: f64,
    pub close_time_ms: Option<i64>,
    pub close_price: Option<f64>,
}

impl Signal {
    pub fn key(&self) -> (String, Timeframe) {
        (self.symbol.clone(), self.timeframe)
    }

    pub fn is_active(&self) -> bool {
        self.state == SignalState::Active
    }

    /// Distance to the stop in price units.
    pub fn risk(&self) -> f64 {
        match self.direction {
            Direction::Long => self.entry - self.sl,
            Direction::Short => self.sl - self.entry,
        }
    }

    /// Distance to the target in price units.
    pub fn reward(&self) -> f64 {
        match self.direction {
            Direction::Long => self.tp - self.entry,
            Direction::Short => self.entry - self.tp,
        }
    }

    /// Fold one observed price into the MAE/MFE ratios. MAE is normalised
    /// by the stop distance, MFE by the target distance. Returns true when
    /// either ratio advanced (the caller throttles publication).
    pub fn update_excursions(&mut self, price: f64) -> bool {
        if self.state != SignalState::Active {
            return false;
        }
        let risk = self.risk();
        let reward = self.reward();
        if risk <= 0.0 || reward <= 0.0 {
            return false;
        }

        let (adverse, favorable) = match self.direction {
            Direction::Long => (self.entry - price, price - self.entry),
            Direction::Short => (price - self.entry, self.entry - price),
        };

        let mut moved = false;
        let adverse_ratio = adverse / risk;
        if adverse_ratio > self.mae_ratio {
            self.mae_ratio = adverse_ratio;
            moved = true;
        }
        let favorable_ratio = favorable / reward;
        if favorable_ratio > self.mfe_ratio {
            self.mfe_ratio = favorable_ratio;
            moved = true;
        }
        moved
    }

    /// Tick path: resolve against a single traded price. TP/SL touches
    /// close at the level itself, not at the observed price.
    pub fn check_outcome_tick(&mut self, price: f64, timestamp_ms: i64) -> Option<OutcomeKind> {
        if self.state != SignalState::Active {
            return None;
        }
        let (tp_hit, sl_hit) = match self.direction {
            Direction::Long => (price >= self.tp, price <= self.sl),
            Direction::Short => (price <= self.tp, price >= self.sl),
        };
        self.resolve(tp_hit, sl_hit, timestamp_ms)
    }

    /// Bar path: resolve against a closed 1m bar's extremes. When the bar
    /// range spans both levels the stop wins (pessimistic rule).
    pub fn check_outcome_bar(&mut self, bar: &Candle) -> Option<OutcomeKind> {
        if self.state != SignalState::Active {
            return None;
        }
        let (tp_hit, sl_hit) = match self.direction {
            Direction::Long => (bar.high >= self.tp, bar.low <= self.sl),
            Direction::Short => (bar.low <= self.tp, bar.high >= self.sl),
        };
        self.resolve(tp_hit, sl_hit, bar.close_time_ms())
    }

    fn resolve(&mut self, tp_hit: bool, sl_hit: bool, timestamp_ms: i64) -> Option<OutcomeKind> {
        let kind = if sl_hit {
            OutcomeKind::Sl
        } else if tp_hit {
            OutcomeKind::Tp
        } else {
            return None;
        };
        let price = match kind {
            OutcomeKind::Tp => self.tp,
            OutcomeKind::Sl => self.sl,
        };
        self.state = kind.into();
        self.close_time_ms = Some(timestamp_ms);
        self.close_price = Some(price);
        Some(kind)
    }
}

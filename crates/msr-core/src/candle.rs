//! Market data primitives: timeframes, candles and trades.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The fixed timeframe universe. 1m arrives from the exchange; the rest are
/// derived locally by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
    ];

    /// Timeframes produced by local aggregation (everything except 1m).
    pub const AGGREGATED: [Timeframe; 4] = [
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
    ];

    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
        }
    }

    pub fn period_ms(self) -> i64 {
        self.minutes() * 60_000
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            other => Err(CoreError::Config(format!("unknown timeframe '{other}'"))),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> String {
        tf.as_str().to_string()
    }
}

/// Key identifying one (symbol, timeframe) series.
pub type SeriesKey = (String, Timeframe);

/// OHLCV candle. `open_time_ms` is aligned to the timeframe's period
/// boundary; only candles with `closed == true` drive the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        (self.symbol.clone(), self.timeframe)
    }

    /// End of the candle's period (exclusive).
    pub fn close_time_ms(&self) -> i64 {
        self.open_time_ms + self.timeframe.period_ms()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Reject candles carrying non-finite or non-positive prices, negative
    /// volume, or an inverted high/low range.
    pub fn validate(&self) -> CoreResult<()> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "{} {} @{}: non-finite or non-positive price",
                self.symbol, self.timeframe, self.open_time_ms
            )));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "{} {} @{}: bad volume {}",
                self.symbol, self.timeframe, self.open_time_ms, self.volume
            )));
        }
        if self.high < self.low {
            return Err(CoreError::InvalidInput(format!(
                "{} {} @{}: high {} < low {}",
                self.symbol, self.timeframe, self.open_time_ms, self.high, self.low
            )));
        }
        Ok(())
    }
}

/// A single aggregated trade from the exchange tick stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub price: f64,
    pub quantity: f64,
}

impl Trade {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "{} trade @{}: bad price {}",
                self.symbol, self.timestamp_ms, self.price
            )));
        }
        if !self.quantity.is_finite() || self.quantity < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "{} trade @{}: bad quantity {}",
                self.symbol, self.timestamp_ms, self.quantity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn candle(tf: Timeframe, t: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: tf,
            open_time_ms: t,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            closed: true,
        }
    }

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn timeframe_period_ms() {
        assert_eq!(Timeframe::M1.period_ms(), 60_000);
        assert_eq!(Timeframe::M30.period_ms(), 1_800_000);
    }

    #[test]
    fn validate_rejects_nan_and_negative() {
        let mut c = candle(Timeframe::M1, 0, 10.0, 11.0, 9.0, 10.5);
        assert!(c.validate().is_ok());

        c.high = f64::NAN;
        assert!(c.validate().is_err());

        let mut c = candle(Timeframe::M1, 0, 10.0, 11.0, 9.0, 10.5);
        c.close = -1.0;
        assert!(c.validate().is_err());

        let mut c = candle(Timeframe::M1, 0, 10.0, 11.0, 9.0, 10.5);
        c.volume = f64::INFINITY;
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let c = candle(Timeframe::M1, 0, 10.0, 9.0, 11.0, 10.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn close_time_is_period_end() {
        let c = candle(Timeframe::M5, 300_000, 10.0, 11.0, 9.0, 10.5);
        assert_eq!(c.close_time_ms(), 600_000);
    }

    #[test]
    fn candle_bias_helpers() {
        let c = candle(Timeframe::M1, 0, 10.0, 11.0, 9.0, 10.5);
        assert!(c.is_bullish());
        assert!(!c.is_bearish());
    }
}

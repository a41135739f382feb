/// Session-cumulative VWAP over typical price (H+L+C)/3 weighted by volume.
///
/// The accumulator resets only when the caller-supplied session epoch
/// advances. The default configuration never advances the epoch, so the
/// VWAP accumulates over the whole life of the series (exchange-day
/// agnostic, matching the Pine Script source of the strategy).
#[derive(Debug, Clone)]
pub struct Vwap {
    epoch: u64,
    cum_pv: f64,
    cum_vol: f64,
    last_close: f64,
}

impl Vwap {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            cum_pv: 0.0,
            cum_vol: 0.0,
            last_close: 0.0,
        }
    }

    /// Feed one bar. `session_epoch` greater than the stored epoch clears
    /// the accumulator before the bar is applied.
    pub fn update(&mut self, high: f64, low: f64, close: f64, volume: f64, session_epoch: u64) -> f64 {
        if session_epoch > self.epoch {
            self.epoch = session_epoch;
            self.cum_pv = 0.0;
            self.cum_vol = 0.0;
        }

        let typical = (high + low + close) / 3.0;
        self.cum_pv += typical * volume;
        self.cum_vol += volume;
        self.last_close = close;

        self.value()
    }

    /// Current VWAP; falls back to the last close while no volume has
    /// accumulated (zero-volume bars at session open).
    pub fn value(&self) -> f64 {
        if self.cum_vol > 0.0 {
            self.cum_pv / self.cum_vol
        } else {
            self.last_close
        }
    }
}

impl Default for Vwap {
    fn default() -> Self {
        Self::new()
    }
}

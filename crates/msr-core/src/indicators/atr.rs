/// Average True Range with Wilder smoothing (RMA), incremental form.
///
/// TR = max(high − low, |high − prev_close|, |low − prev_close|); the first
/// bar has no previous close so TR falls back to high − low. The first ATR
/// is a simple mean of the first `window` true ranges; afterwards
/// `ATR = (prev_ATR · (window − 1) + TR) / window`. The recursion order is
/// load-bearing — downstream TP/SL prices must match tick-for-tick.
#[derive(Debug, Clone)]
pub struct Atr {
    window: usize,
    prev_close: f64,
    has_prev: bool,
    value: f64,
    tr_sum: f64,
    tr_count: usize,
}

impl Atr {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            prev_close: 0.0,
            has_prev: false,
            value: 0.0,
            tr_sum: 0.0,
            tr_count: 0,
        }
    }

    /// Feed one bar. Non-finite inputs are rejected: the current ATR is
    /// returned unchanged and no state advances.
    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        if !high.is_finite() || !low.is_finite() || !close.is_finite() {
            return self.value;
        }

        let tr = if self.has_prev {
            (high - low)
                .max((high - self.prev_close).abs())
                .max((low - self.prev_close).abs())
        } else {
            high - low
        };
        self.has_prev = true;
        self.prev_close = close;

        if self.tr_count < self.window {
            self.tr_sum += tr;
            self.tr_count += 1;
            self.value = self.tr_sum / self.tr_count as f64;
        } else {
            self.value = (self.value * (self.window as f64 - 1.0) + tr) / self.window as f64;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_warm(&self) -> bool {
        self.tr_count >= self.window
    }
}

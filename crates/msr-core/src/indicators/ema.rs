/// Exponential Moving Average — incremental form.
///
/// Matches pandas `ewm(span=window, adjust=False).mean()`:
///   bar 0  → value = price (seed with the first observation)
///   bar 1+ → value = α·price + (1−α)·prev   where α = 2/(window+1)
///
/// `is_warm()` turns true once `window` bars have been seen so callers can
/// skip the warmup region.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: f64,
    window: usize,
    count: usize,
}

impl Ema {
    pub fn new(window: usize) -> Self {
        Self {
            alpha: 2.0 / (window as f64 + 1.0),
            value: 0.0,
            window,
            count: 0,
        }
    }

    /// Feed one close price, return the current EMA value.
    pub fn update(&mut self, price: f64) -> f64 {
        if self.count == 0 {
            self.value = price;
        } else {
            self.value = self.alpha * price + (1.0 - self.alpha) * self.value;
        }
        self.count += 1;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_warm(&self) -> bool {
        self.count >= self.window
    }
}

use super::RingBuf;

/// Fibonacci retracement fractions used by the retest strategy.
pub const FIB_382: f64 = 0.382;
pub const FIB_500: f64 = 0.500;
pub const FIB_618: f64 = 0.618;

/// The three retracement levels for the current rolling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FibLevels {
    pub fib_382: f64,
    pub fib_500: f64,
    pub fib_618: f64,
}

/// Rolling highest-high / lowest-low window producing Fibonacci levels:
/// `level = hh − (hh − ll) · f`. Undefined until the window holds `window`
/// bars.
#[derive(Debug, Clone)]
pub struct FibWindow {
    highs: RingBuf,
    lows: RingBuf,
}

impl FibWindow {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            highs: RingBuf::new(window),
            lows: RingBuf::new(window),
        }
    }

    pub fn update(&mut self, high: f64, low: f64) -> Option<FibLevels> {
        self.highs.push(high);
        self.lows.push(low);
        self.levels()
    }

    pub fn levels(&self) -> Option<FibLevels> {
        if !self.highs.full() {
            return None;
        }
        let hh = self.highs.max();
        let ll = self.lows.min();
        let range = hh - ll;
        Some(FibLevels {
            fib_382: hh - range * FIB_382,
            fib_500: hh - range * FIB_500,
            fib_618: hh - range * FIB_618,
        })
    }

    pub fn is_warm(&self) -> bool {
        self.highs.full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_until_window_full() {
        let mut fib = FibWindow::new(3);
        assert!(fib.update(10.0, 9.0).is_none());
        assert!(fib.update(11.0, 8.0).is_none());
        assert!(fib.update(12.0, 9.5).is_some());
        assert!(fib.is_warm());
    }

    #[test]
    fn levels_from_rolling_extremes() {
        let mut fib = FibWindow::new(3);
        fib.update(10.0, 9.0);
        fib.update(11.0, 8.0);
        let levels = fib.update(12.0, 9.5).unwrap();
        // hh = 12, ll = 8, range = 4.
        assert!((levels.fib_382 - (12.0 - 4.0 * 0.382)).abs() < 1e-10);
        assert!((levels.fib_500 - 10.0).abs() < 1e-10);
        assert!((levels.fib_618 - (12.0 - 4.0 * 0.618)).abs() < 1e-10);
    }

    #[test]
    fn window_slides() {
        let mut fib = FibWindow::new(2);
        fib.update(10.0, 9.0);
        fib.update(11.0, 8.0);
        // The 10/9 bar falls out; extremes are now 11..13 high, 8..10 low.
        let levels = fib.update(13.0, 10.0).unwrap();
        assert!((levels.fib_500 - (13.0 - 5.0 * 0.5)).abs() < 1e-10);
    }
}

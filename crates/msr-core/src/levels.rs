//! Support/resistance classification and proximity scoring over the four
//! strategy levels (three Fibonacci retracements plus VWAP).

use crate::indicators::IndicatorSnapshot;

/// Levels split by side relative to the close. A level equal to the close
/// counts as support (the `close < level` test selects resistance).
#[derive(Debug, Clone, Default)]
pub struct ClassifiedLevels {
    pub supports: Vec<f64>,
    pub resistances: Vec<f64>,
}

pub fn classify(close: f64, snap: &IndicatorSnapshot) -> ClassifiedLevels {
    let mut out = ClassifiedLevels::default();
    for level in snap.levels() {
        if close < level {
            out.resistances.push(level);
        } else {
            out.supports.push(level);
        }
    }
    out
}

/// Nearest support strictly below and nearest resistance strictly above the
/// close. Levels sitting exactly on the close are excluded on both sides.
pub fn nearest(close: f64, levels: &ClassifiedLevels) -> (Option<f64>, Option<f64>) {
    let mut nearest_support: Option<f64> = None;
    for &level in &levels.supports {
        if level < close && nearest_support.map_or(true, |s| level > s) {
            nearest_support = Some(level);
        }
    }

    let mut nearest_resistance: Option<f64> = None;
    for &level in &levels.resistances {
        if level > close && nearest_resistance.map_or(true, |r| level < r) {
            nearest_resistance = Some(level);
        }
    }

    (nearest_support, nearest_resistance)
}

/// Proximity score for one side: Σ 1/(1 + |price − level| / price · 100)
/// over the levels strictly beyond the price on that side. Returns
/// (score, counted levels).
pub fn side_score(price: f64, levels: &[f64], is_support: bool) -> (f64, usize) {
    let mut score = 0.0;
    let mut count = 0usize;
    for &level in levels {
        let beyond = if is_support { level < price } else { level > price };
        if beyond {
            let dist_pct = (price - level).abs() / price * 100.0;
            score += 1.0 / (1.0 + dist_pct);
            count += 1;
        }
    }
    (score, count)
}

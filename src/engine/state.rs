use crate::config::trading::VolatilityThreshold;
use crate::constants::{
    BASE_ADJUSTMENT_INTERVAL, GRID_SIZE_HYSTERESIS, PRICE_HISTORY_CAP, VOLATILITY_ANNUALIZATION,
    VOLATILITY_WINDOW,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// Market and grid snapshot shared by the controller and the strategy slot.
#[derive(Debug, Clone, Default)]
pub struct GridState {
    pub base_price: f64,
    pub current_price: f64,
    /// Spacing between adjacent levels, in percent.
    pub grid_size: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    pub volatility: f64,
    /// Newest last.
    pub price_history: VecDeque<f64>,
    pub last_adjustment_time: Option<DateTime<Utc>>,
}

impl GridState {
    pub fn new(grid_size: f64) -> Self {
        Self {
            grid_size,
            price_history: VecDeque::with_capacity(PRICE_HISTORY_CAP),
            ..Self::default()
        }
    }

    pub fn record_price(&mut self, price: f64) {
        self.current_price = price;
        if self.price_history.len() >= PRICE_HISTORY_CAP {
            self.price_history.pop_front();
        }
        self.price_history.push_back(price);
    }

    /// Keeps the previous value when there is not enough history yet.
    pub fn update_volatility(&mut self) -> f64 {
        if let Some(v) = compute_volatility(&self.price_history) {
            self.volatility = v;
        }
        self.volatility
    }

    pub fn recompute_bands(&mut self) {
        let (lower, upper) = bands(self.base_price, self.grid_size);
        self.lower_band = lower;
        self.upper_band = upper;
    }
}

/// Returns `(lower, upper)` at one grid step around `base_price`.
pub fn bands(base_price: f64, grid_size: f64) -> (f64, f64) {
    let g = grid_size / 100.0;
    (base_price * (1.0 - g), base_price * (1.0 + g))
}

/// Annualized standard deviation of simple returns over the newest samples.
///
/// * `history` - Prices, newest last.
///
/// Returns `None` with fewer than two samples.
pub fn compute_volatility(history: &VecDeque<f64>) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let window = history.len().min(VOLATILITY_WINDOW);
    let start = history.len() - window;
    let samples: Vec<f64> = history.iter().skip(start).copied().collect();

    let returns: Vec<f64> = samples
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.is_empty() {
        return Some(0.0);
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() * VOLATILITY_ANNUALIZATION.sqrt())
}

/// Grid size for `volatility` from the first matching threshold range.
///
/// * `thresholds` - Ordered `[lo, hi)` ranges.
/// * `max_size` - Used when no range matches.
pub fn grid_size_for_volatility(
    thresholds: &[VolatilityThreshold],
    max_size: f64,
    volatility: f64,
) -> f64 {
    thresholds
        .iter()
        .find(|t| t.contains(volatility))
        .map(|t| t.grid_size)
        .unwrap_or(max_size)
}

/// Minimum time between grid size changes; shorter when the market is moving.
pub fn adjustment_interval(volatility: f64) -> Duration {
    let scale = if volatility > 0.8 {
        0.25
    } else if volatility > 0.4 {
        0.5
    } else if volatility > 0.2 {
        0.75
    } else {
        1.0
    };
    BASE_ADJUSTMENT_INTERVAL.mul_f64(scale)
}

/// Whether a change from `current` to `target` is due at `now`.
pub fn adjustment_due(
    current: f64,
    target: f64,
    volatility: f64,
    last_adjustment: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let elapsed_ok = match last_adjustment {
        None => true,
        Some(at) => (now - at).to_std().unwrap_or_default() >= adjustment_interval(volatility),
    };
    elapsed_ok && (target - current).abs() > GRID_SIZE_HYSTERESIS
}

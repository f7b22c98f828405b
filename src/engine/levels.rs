use crate::constants::{LEVELS_PER_SIDE, LEVEL_PRICE_DECIMALS, LEVEL_REBUILD_THRESHOLD};
use crate::model::OrderSide;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Level price scaled to an integer at the level rounding precision, so equal
/// rounded prices always map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriceKey(i64);

impl PriceKey {
    pub fn from_price(price: f64) -> Self {
        Self((price * 10f64.powi(LEVEL_PRICE_DECIMALS as i32)).round() as i64)
    }

    pub fn price(&self) -> f64 {
        self.0 as f64 / 10f64.powi(LEVEL_PRICE_DECIMALS as i32)
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.price())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridLevel {
    /// -5..=-1 below the base, 1..=5 above. Zero is never a level.
    pub index: i32,
    pub price: f64,
    pub side: OrderSide,
    pub occupied: bool,
    /// Time of the last failed placement.
    pub last_attempt: Option<DateTime<Utc>>,
}

impl GridLevel {
    pub fn key(&self) -> PriceKey {
        PriceKey::from_price(self.price)
    }
}

fn round_price(price: f64) -> f64 {
    let factor = 10f64.powi(LEVEL_PRICE_DECIMALS as i32);
    (price * factor).round() / factor
}

/// Price of level `index` for the given base and grid size (percent).
pub fn level_price(base_price: f64, grid_size: f64, index: i32) -> f64 {
    round_price(base_price * (1.0 + index as f64 * grid_size / 100.0))
}

/// The ±5 price levels around the base with their occupancy and cooldowns.
#[derive(Debug, Clone)]
pub struct GridLevelTable {
    levels: BTreeMap<PriceKey, GridLevel>,
    cooldown: Duration,
}

impl GridLevelTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            levels: BTreeMap::new(),
            cooldown,
        }
    }

    /// Replaces the table. Callers release or cancel orders on the old
    /// levels first.
    pub fn build(&mut self, base_price: f64, grid_size: f64) {
        self.levels.clear();
        for index in (-LEVELS_PER_SIDE..=LEVELS_PER_SIDE).filter(|i| *i != 0) {
            let price = level_price(base_price, grid_size, index);
            let side = if index < 0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let level = GridLevel {
                index,
                price,
                side,
                occupied: false,
                last_attempt: None,
            };
            self.levels.insert(level.key(), level);
        }
    }

    /// True when empty, or when the lowest level has drifted by more than the
    /// rebuild threshold from where `(base_price, grid_size)` would put it.
    pub fn needs_rebuild(&self, base_price: f64, grid_size: f64) -> bool {
        match self.lowest_price() {
            None => true,
            Some(lowest) => {
                let expected = level_price(base_price, grid_size, -LEVELS_PER_SIDE);
                (lowest - expected).abs() > LEVEL_REBUILD_THRESHOLD
            }
        }
    }

    pub fn lowest_price(&self) -> Option<f64> {
        self.levels.values().next().map(|l| l.price)
    }

    pub fn is_cooling_down(&self, level: &GridLevel, now: DateTime<Utc>) -> bool {
        match level.last_attempt {
            None => false,
            Some(at) => (now - at).to_std().unwrap_or_default() < self.cooldown,
        }
    }

    /// Unoccupied levels outside their cooldown, lowest price first.
    pub fn eligible(&self, now: DateTime<Utc>) -> Vec<GridLevel> {
        self.levels
            .values()
            .filter(|l| !l.occupied && !self.is_cooling_down(l, now))
            .cloned()
            .collect()
    }

    /// Returns `false` if the level is missing or already holds an order.
    pub fn mark_occupied(&mut self, key: PriceKey) -> bool {
        match self.levels.get_mut(&key) {
            Some(level) if !level.occupied => {
                level.occupied = true;
                level.last_attempt = None;
                true
            }
            _ => false,
        }
    }

    /// Frees a level after a fill or cancel.
    pub fn release(&mut self, key: PriceKey) -> bool {
        match self.levels.get_mut(&key) {
            Some(level) if level.occupied => {
                level.occupied = false;
                true
            }
            _ => false,
        }
    }

    pub fn record_failure(&mut self, key: PriceKey, now: DateTime<Utc>) {
        if let Some(level) = self.levels.get_mut(&key) {
            level.last_attempt = Some(now);
        }
    }

    pub fn occupied_count(&self) -> usize {
        self.levels.values().filter(|l| l.occupied).count()
    }

    pub fn get(&self, key: PriceKey) -> Option<&GridLevel> {
        self.levels.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

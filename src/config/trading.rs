use crate::model::TradingMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TradingConfig {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Minimum notional (quote asset) for a single grid order.
    #[serde(default = "default_min_trade_amount")]
    pub min_trade_amount: f64,
    /// Operator-supplied base price. Zero means "derive from market or saved state".
    #[serde(default)]
    pub initial_base_price: f64,
}

fn default_symbol() -> String {
    "BNB/USDT".to_string()
}

fn default_leverage() -> u32 {
    1
}

fn default_min_trade_amount() -> f64 {
    20.0
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Spot,
            symbol: default_symbol(),
            leverage: default_leverage(),
            min_trade_amount: default_min_trade_amount(),
            initial_base_price: 0.0,
        }
    }
}

impl TradingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.symbol.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Symbol '{}' must be in 'Base/Quote' format",
                    self.symbol
                ))
            }
        }
        match self.mode {
            TradingMode::Spot if self.leverage != 1 => {
                return Err(anyhow::anyhow!("Leverage must be 1 for spot trading"));
            }
            TradingMode::Futures if self.leverage == 0 || self.leverage > 125 => {
                return Err(anyhow::anyhow!("Leverage must be between 1 and 125"));
            }
            _ => {}
        }
        if self.min_trade_amount <= 0.0 {
            return Err(anyhow::anyhow!("min_trade_amount must be positive."));
        }
        if self.initial_base_price < 0.0 {
            return Err(anyhow::anyhow!("initial_base_price must not be negative."));
        }
        Ok(())
    }
}

/// One row of the volatility → grid size table. `range` is half-open `[lo, hi)`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VolatilityThreshold {
    pub range: [f64; 2],
    pub grid_size: f64,
}

impl VolatilityThreshold {
    pub fn new(lo: f64, hi: f64, grid_size: f64) -> Self {
        Self {
            range: [lo, hi],
            grid_size,
        }
    }

    pub fn contains(&self, volatility: f64) -> bool {
        self.range[0] <= volatility && volatility < self.range[1]
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GridConfig {
    /// Grid spacing in percent.
    #[serde(default = "default_initial_size")]
    pub initial_size: f64,
    #[serde(default = "default_min_size")]
    pub min_size: f64,
    #[serde(default = "default_max_size")]
    pub max_size: f64,
    #[serde(default = "default_true")]
    pub dynamic_adjustment: bool,
    #[serde(default = "default_volatility_thresholds")]
    pub volatility_thresholds: Vec<VolatilityThreshold>,
    /// Wait after a failed placement before the level is retried.
    #[serde(default = "default_level_cooldown_secs")]
    pub level_cooldown_secs: u64,
}

fn default_initial_size() -> f64 {
    2.0
}

fn default_min_size() -> f64 {
    1.0
}

fn default_max_size() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

fn default_level_cooldown_secs() -> u64 {
    300
}

fn default_volatility_thresholds() -> Vec<VolatilityThreshold> {
    vec![
        VolatilityThreshold::new(0.0, 0.2, 1.0),
        VolatilityThreshold::new(0.2, 0.4, 1.5),
        VolatilityThreshold::new(0.4, 0.6, 2.0),
        VolatilityThreshold::new(0.6, 0.8, 2.5),
        VolatilityThreshold::new(0.8, 1.2, 3.0),
        VolatilityThreshold::new(1.2, 10.0, 4.0),
    ]
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            initial_size: default_initial_size(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            dynamic_adjustment: true,
            volatility_thresholds: default_volatility_thresholds(),
            level_cooldown_secs: default_level_cooldown_secs(),
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, size) in [
            ("initial_size", self.initial_size),
            ("min_size", self.min_size),
            ("max_size", self.max_size),
        ] {
            if size <= 0.0 || size > 10.0 {
                return Err(anyhow::anyhow!(
                    "Grid {} {} must be within (0, 10].",
                    name,
                    size
                ));
            }
        }
        if self.min_size >= self.max_size {
            return Err(anyhow::anyhow!(
                "Grid min_size {} must be less than max_size {}.",
                self.min_size,
                self.max_size
            ));
        }
        if self.initial_size < self.min_size || self.initial_size > self.max_size {
            return Err(anyhow::anyhow!(
                "Grid initial_size {} must be between min_size {} and max_size {}.",
                self.initial_size,
                self.min_size,
                self.max_size
            ));
        }
        for threshold in &self.volatility_thresholds {
            let [lo, hi] = threshold.range;
            if lo >= hi {
                return Err(anyhow::anyhow!(
                    "Volatility range [{}, {}) is empty.",
                    lo,
                    hi
                ));
            }
            if threshold.grid_size <= 0.0 || threshold.grid_size > 10.0 {
                return Err(anyhow::anyhow!(
                    "Threshold grid_size {} must be within (0, 10].",
                    threshold.grid_size
                ));
            }
        }
        Ok(())
    }
}

/// Control loop timing.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_position_update_interval")]
    pub position_update_interval: u64,
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_error_backoff_secs() -> u64 {
    30
}

fn default_position_update_interval() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            position_update_interval: default_position_update_interval(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_secs == 0
            || self.error_backoff_secs == 0
            || self.position_update_interval == 0
        {
            return Err(anyhow::anyhow!("Engine intervals must be positive."));
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};

/// Secondary strategy slots, keyed by strategy name.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub breakout: BreakoutConfig,
}

impl StrategiesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.breakout.validate()
    }
}

/// Rebalance toward a target position ratio on an N-day high/low breakout.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakoutConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,
    /// Target position ratio after a breakout above the high.
    #[serde(default = "default_sell_target_percent")]
    pub sell_target_percent: f64,
    /// Target position ratio after a breakout below the low.
    #[serde(default = "default_buy_target_percent")]
    pub buy_target_percent: f64,
    #[serde(default = "default_min_adjustment_interval")]
    pub min_adjustment_interval: u64,
    /// Place market orders for signals instead of only reporting them.
    #[serde(default)]
    pub execute_adjustments: bool,
}

fn default_true() -> bool {
    true
}

fn default_lookback_days() -> usize {
    52
}

fn default_sell_target_percent() -> f64 {
    0.50
}

fn default_buy_target_percent() -> f64 {
    0.70
}

fn default_min_adjustment_interval() -> u64 {
    300
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_days: default_lookback_days(),
            sell_target_percent: default_sell_target_percent(),
            buy_target_percent: default_buy_target_percent(),
            min_adjustment_interval: default_min_adjustment_interval(),
            execute_adjustments: false,
        }
    }
}

impl BreakoutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lookback_days == 0 || self.lookback_days > 365 {
            return Err(anyhow::anyhow!(
                "lookback_days {} must be between 1 and 365.",
                self.lookback_days
            ));
        }
        for (name, target) in [
            ("sell_target_percent", self.sell_target_percent),
            ("buy_target_percent", self.buy_target_percent),
        ] {
            if !(0.0..=1.0).contains(&target) {
                return Err(anyhow::anyhow!("{} {} must be within [0, 1].", name, target));
            }
        }
        Ok(())
    }
}

pub fn print_strategy_help() {
    println!("Available Strategies:\n");

    println!("1. Grid (always active)");
    println!("   Description: Five buy levels below and five sell levels above a base price.");
    println!("   Parameters ([grid]):");
    println!("     - initial_size (f64): Starting grid spacing in percent (default 2.0).");
    println!("     - min_size / max_size (f64): Bounds for dynamic spacing (default 1.0 / 4.0).");
    println!("     - dynamic_adjustment (bool): Adapt spacing to volatility (default true).");
    println!("     - volatility_thresholds (table): [[range = [lo, hi], grid_size]] rows.");
    println!("     - level_cooldown_secs (u64): Wait after a failed placement (default 300).");
    println!();

    println!("2. Breakout Rebalancer ([strategies.breakout])");
    println!("   Description: Rebalances toward a target position ratio when price");
    println!("                breaks the N-day high or low.");
    println!("   Parameters:");
    println!("     - enabled (bool): Evaluate this slot every tick (default true).");
    println!("     - lookback_days (usize): Completed days in the range (default 52).");
    println!("     - sell_target_percent (f64): Target ratio above the high (default 0.50).");
    println!("     - buy_target_percent (f64): Target ratio below the low (default 0.70).");
    println!("     - min_adjustment_interval (u64): Seconds between signals (default 300).");
    println!("     - execute_adjustments (bool): Place market orders (default false).");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakout_defaults() {
        let config: StrategiesConfig = toml::from_str("").unwrap();
        assert!(config.breakout.enabled);
        assert_eq!(config.breakout.lookback_days, 52);
        assert!((config.breakout.sell_target_percent - 0.5).abs() < 1e-9);
        assert!((config.breakout.buy_target_percent - 0.7).abs() < 1e-9);
        assert!(!config.breakout.execute_adjustments);
    }

    #[test]
    fn test_breakout_validation() {
        let config = BreakoutConfig {
            lookback_days: 0,
            ..BreakoutConfig::default()
        };
        assert!(config.validate().is_err());

        let config = BreakoutConfig {
            buy_target_percent: 1.5,
            ..BreakoutConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

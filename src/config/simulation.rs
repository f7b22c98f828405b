use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// How the paper exchange seeds account balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalanceMode {
    /// Large balances split evenly in value between base and quote (default)
    #[default]
    Unlimited,
    /// Exactly the balances listed in `balance_overrides`
    Override,
}

/// Configuration for the in-memory paper exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Balance mode: "unlimited" or "override"
    #[serde(default)]
    pub balance_mode: BalanceMode,

    /// Per-asset starting balances (used when balance_mode is "override")
    /// Maps asset symbol (e.g., "USDT", "BNB") to balance amount
    #[serde(default, alias = "balances")]
    pub balance_overrides: HashMap<String, f64>,

    /// Quote balance for unlimited mode
    #[serde(default = "default_unlimited_amount")]
    pub unlimited_amount: f64,

    /// Opening market price
    #[serde(default = "default_initial_price")]
    pub initial_price: f64,

    /// Max move per ticker poll in percent. Zero freezes the price.
    #[serde(default = "default_random_walk_step_pct")]
    pub random_walk_step_pct: f64,

    #[serde(default = "default_amount_decimals")]
    pub amount_decimals: u32,

    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,

    /// Completed daily candles generated as history at startup
    #[serde(default = "default_history_days")]
    pub history_days: usize,
}

fn default_unlimited_amount() -> f64 {
    1_000_000.0
}

fn default_initial_price() -> f64 {
    300.0
}

fn default_random_walk_step_pct() -> f64 {
    0.1
}

fn default_amount_decimals() -> u32 {
    6
}

fn default_price_decimals() -> u32 {
    4
}

fn default_history_days() -> usize {
    60
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            balance_mode: BalanceMode::Unlimited,
            balance_overrides: HashMap::new(),
            unlimited_amount: default_unlimited_amount(),
            initial_price: default_initial_price(),
            random_walk_step_pct: default_random_walk_step_pct(),
            amount_decimals: default_amount_decimals(),
            price_decimals: default_price_decimals(),
            history_days: default_history_days(),
        }
    }
}

impl SimulationConfig {
    /// Starting balances for the given market.
    pub fn starting_balances(&self, base: &str, quote: &str) -> HashMap<String, f64> {
        match self.balance_mode {
            BalanceMode::Override => self.balance_overrides.clone(),
            BalanceMode::Unlimited => {
                let mut balances = HashMap::new();
                balances.insert(quote.to_string(), self.unlimited_amount);
                if self.initial_price > 0.0 {
                    balances.insert(base.to_string(), self.unlimited_amount / self.initial_price);
                }
                balances
            }
        }
    }
}

/// Load paper exchange configuration from a JSON file.
///
/// Resolution order:
/// 1. Explicit path argument
/// 2. GRID_SIMULATION_CONFIG_FILE environment variable
/// 3. Default: "simulation_config.json" in current directory
///
/// A missing or unreadable file yields the default configuration.
pub fn load_simulation_config(path: Option<&str>) -> SimulationConfig {
    let config_path = path
        .map(String::from)
        .or_else(|| env::var("GRID_SIMULATION_CONFIG_FILE").ok())
        .unwrap_or_else(|| "simulation_config.json".to_string());

    if !Path::new(&config_path).exists() {
        log::info!(
            "[PAPER] Simulation config not found at '{}', using defaults",
            config_path
        );
        return SimulationConfig::default();
    }

    match read_simulation_config(&config_path) {
        Ok(config) => {
            log::info!("[PAPER] Loaded simulation config from '{}'", config_path);
            config
        }
        Err(e) => {
            log::warn!("[PAPER] {:#}. Using defaults.", e);
            SimulationConfig::default()
        }
    }
}

fn read_simulation_config(path: &str) -> Result<SimulationConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read simulation config from '{}'", path))?;
    let mut json: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse JSON from '{}'", path))?;

    // "//"-prefixed keys are comments.
    if let Some(obj) = json.as_object_mut() {
        obj.retain(|k, _| !k.starts_with("//"));
    }

    serde_json::from_value(json)
        .with_context(|| format!("Invalid simulation config in '{}'", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SimulationConfig::default();
        assert_eq!(config.balance_mode, BalanceMode::Unlimited);
        assert_eq!(config.unlimited_amount, 1_000_000.0);
        assert!(config.balance_overrides.is_empty());
    }

    #[test]
    fn test_unlimited_balances_split_by_value() {
        let config = SimulationConfig {
            initial_price: 250.0,
            ..SimulationConfig::default()
        };
        let balances = config.starting_balances("BNB", "USDT");
        assert_eq!(balances.get("USDT"), Some(&1_000_000.0));
        assert_eq!(balances.get("BNB"), Some(&4_000.0));
    }

    #[test]
    fn test_override_with_comments() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"// note": "ignored", "balance_mode": "override", "balances": {{"USDT": 5000.0}}, "initial_price": 600.0}}"#
        )
        .unwrap();
        let config = load_simulation_config(file.path().to_str());
        assert_eq!(config.balance_mode, BalanceMode::Override);
        assert_eq!(config.starting_balances("BNB", "USDT").get("USDT"), Some(&5000.0));
        assert_eq!(config.initial_price, 600.0);
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let config = load_simulation_config(Some("/nonexistent/path.json"));
        assert_eq!(config.balance_mode, BalanceMode::Unlimited);
    }
}

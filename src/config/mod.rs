use self::broadcast::NotificationConfig;
use self::risk::RiskConfig;
use self::strategy::StrategiesConfig;
use self::trading::{EngineConfig, GridConfig, TradingConfig};
use crate::error::BotError;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

pub mod broadcast;
pub mod creator;
pub mod exchange;
pub mod risk;
pub mod simulation;
pub mod strategy;
pub mod trading;

#[cfg(test)]
mod test_secrets;

/// Complete bot configuration as read from the TOML file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BotConfig {
    pub fn symbol(&self) -> &str {
        &self.trading.symbol
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.trading.validate()?;
        self.grid.validate()?;
        self.risk.validate()?;
        self.strategies.validate()?;
        self.engine.validate()?;
        self.data.validate()?;
        self.notifications.validate()?;
        Ok(())
    }

    /// Environment values win over the file for operator-supplied overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var("INITIAL_BASE_PRICE") {
            match raw.trim().parse::<f64>() {
                Ok(price) if price > 0.0 => self.trading.initial_base_price = price,
                Ok(_) => {}
                Err(e) => log::warn!("Ignoring INITIAL_BASE_PRICE '{}': {}", raw, e),
            }
        }
        if self.risk.reset_token.is_none() {
            self.risk.reset_token = read_env_or_file("RISK_RESET_TOKEN").ok();
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DataConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_trades_file")]
    pub trades_file: String,
    /// Seconds between state snapshots.
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,
    /// Rotated copies of the state file kept on disk.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
    /// Upper bound on trade history queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_state_file() -> String {
    "data/grid_state.json".to_string()
}

fn default_trades_file() -> String {
    "data/trades.csv".to_string()
}

fn default_save_interval() -> u64 {
    60
}

fn default_backup_count() -> usize {
    10
}

fn default_history_limit() -> usize {
    1000
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            trades_file: default_trades_file(),
            save_interval: default_save_interval(),
            backup_count: default_backup_count(),
            history_limit: default_history_limit(),
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.save_interval == 0 {
            return Err(anyhow!("save_interval must be positive."));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be positive."));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: default_log_directory(),
        }
    }
}

pub fn load_config(path: &str) -> Result<BotConfig, BotError> {
    dotenvy::dotenv().ok();
    let content = fs::read_to_string(path)?;
    let mut config: BotConfig = toml::from_str(&content)?;
    config.apply_env_overrides();
    config
        .validate()
        .map_err(|e| BotError::ValidationError(e.to_string()))?;
    Ok(config)
}

/// Reads `NAME` from the environment, falling back to the file named by `NAME_FILE`.
pub fn read_env_or_file(name: &str) -> anyhow::Result<String> {
    if let Ok(value) = env::var(name) {
        return Ok(value);
    }
    let file_var = format!("{}_FILE", name);
    let path = env::var(&file_var).map_err(|_| anyhow!("Neither {} nor {} is set", name, file_var))?;
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {} at {}", file_var, path))?;
    Ok(content.trim().to_string())
}

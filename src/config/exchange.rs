use anyhow::Result;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange backend selected by `init_exchange`.
    pub kind: String,
    pub network: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: "paper".to_string(),
            network: "testnet".to_string(),
        }
    }
}

pub fn load_exchange_config() -> Result<ExchangeConfig> {
    dotenv().ok(); // Load .env file if it exists, ignore if missing (env vars might be set otherwise)

    let defaults = ExchangeConfig::default();
    let kind = env::var("EXCHANGE_KIND").unwrap_or(defaults.kind);
    let network = env::var("EXCHANGE_NETWORK").unwrap_or(defaults.network);

    if kind.trim().is_empty() {
        return Err(anyhow::anyhow!("EXCHANGE_KIND must not be empty"));
    }

    Ok(ExchangeConfig { kind, network })
}

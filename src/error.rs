use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Config error: {0}")]
    ConfigError(#[from] std::io::Error),
    #[error("Parsing error: {0}")]
    ParsingError(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Failures reported by an exchange collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Insufficient {asset} balance: need {required:.8}, free {available:.8}")]
    InsufficientBalance {
        asset: String,
        required: f64,
        available: f64,
    },
    #[error("Order {0} not found")]
    OrderNotFound(String),
    #[error("Unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("Market data unavailable: {0}")]
    MarketData(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiskError {
    #[error("Emergency stop reset is unavailable: no reset token configured")]
    ResetUnavailable,
    #[error("Invalid emergency stop reset token")]
    InvalidResetToken,
    #[error("Emergency stop is not active")]
    NotStopped,
}

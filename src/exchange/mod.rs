//! Exchange collaborator contract.
//!
//! The control loop only talks to an exchange through [`Exchange`]. Transport,
//! retries and symbol precision rules belong to the implementation; the core
//! treats any `Err` as "this attempt did not succeed" and moves on.

pub mod paper;

use crate::config::exchange::ExchangeConfig;
use crate::config::simulation::SimulationConfig;
use crate::config::trading::TradingConfig;
use crate::model::{
    BalanceSnapshot, Candle, OrderHandle, OrderSide, OrderStatusReport, PositionSnapshot,
    TradingMode,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> TradingMode;

    async fn get_ticker(&self, symbol: &str) -> Result<f64>;

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderHandle>;

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderHandle>;

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<()>;

    async fn get_order_status(&self, id: &str, symbol: &str) -> Result<OrderStatusReport>;

    async fn get_balance(&self) -> Result<BalanceSnapshot>;

    /// Open futures position, `None` when flat or in spot mode.
    async fn get_position(&self, symbol: &str) -> Result<Option<PositionSnapshot>>;

    /// Daily candles, oldest first. The last candle is the still-forming day.
    async fn get_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Cancels every open order, optionally restricted to one symbol. Returns the count.
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize>;

    /// Total account value in the quote currency.
    async fn get_account_value(&self) -> Result<f64>;

    fn adjust_amount_precision(&self, symbol: &str, amount: f64) -> f64;

    fn adjust_price_precision(&self, symbol: &str, price: f64) -> f64;
}

/// Builds the exchange backend named by `config.kind`.
pub fn init_exchange(
    config: &ExchangeConfig,
    trading: &TradingConfig,
    sim: &SimulationConfig,
) -> Result<Arc<dyn Exchange>> {
    match config.kind.as_str() {
        "paper" => Ok(Arc::new(paper::PaperExchange::new(
            &trading.symbol,
            trading.mode,
            trading.leverage,
            sim,
        ))),
        other => Err(anyhow!(
            "Unsupported exchange '{}'. Available: paper",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_exchange_by_kind() {
        let trading = TradingConfig::default();
        let sim = SimulationConfig::default();

        let exchange = init_exchange(&ExchangeConfig::default(), &trading, &sim).unwrap();
        assert_eq!(exchange.name(), "paper");
        assert_eq!(exchange.mode(), TradingMode::Spot);

        let unknown = ExchangeConfig {
            kind: "binance".to_string(),
            ..ExchangeConfig::default()
        };
        assert!(init_exchange(&unknown, &trading, &sim).is_err());
    }
}

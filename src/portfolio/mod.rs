//! Position and portfolio accounting.
//!
//! Converts exchange balance and position data into [`PortfolioMetrics`] for
//! both spot and futures accounts, and tracks peak value, drawdown and the
//! daily PnL baseline. Each update produces a fresh [`PortfolioSnapshot`]
//! published through a `watch` channel, so readers always see a whole record.

use crate::constants::DAILY_RESET_INTERVAL;
use crate::exchange::Exchange;
use crate::model::{split_symbol, PositionSide, TradingMode};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub notional_value: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub total_balance: f64,
    pub available_balance: f64,
    pub position_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub total_pnl: f64,
    pub position_ratio: f64,
    pub leverage_ratio: f64,
    pub margin_ratio: f64,
}

/// Metrics plus the performance figures the risk evaluator consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub metrics: PortfolioMetrics,
    pub position: Option<PositionInfo>,
    pub portfolio_value: f64,
    pub peak_value: f64,
    /// `(current - peak) / peak`, never positive.
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub daily_start_value: f64,
    pub daily_pnl: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn safe_divide(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

/// Reads balances and positions and derives the account metrics.
pub async fn collect_metrics(
    exchange: &dyn Exchange,
    symbol: &str,
    realized_pnl: f64,
) -> Result<(PortfolioMetrics, Option<PositionInfo>)> {
    match exchange.mode() {
        TradingMode::Futures => futures_metrics(exchange, symbol, realized_pnl).await,
        TradingMode::Spot => spot_metrics(exchange, symbol, realized_pnl).await,
    }
}

async fn futures_metrics(
    exchange: &dyn Exchange,
    symbol: &str,
    realized_pnl: f64,
) -> Result<(PortfolioMetrics, Option<PositionInfo>)> {
    let (_, quote) = split_symbol(symbol);
    let balance = exchange
        .get_balance()
        .await
        .context("Failed to fetch futures balance")?;
    let total = balance.total(quote);
    let available = balance.free(quote);

    let position = exchange
        .get_position(symbol)
        .await
        .context("Failed to fetch futures position")?
        .map(|p| PositionInfo {
            symbol: symbol.to_string(),
            side: p.side,
            size: p.size,
            entry_price: p.entry_price,
            current_price: p.mark_price,
            unrealized_pnl: p.unrealized_pnl,
            notional_value: p.notional.abs(),
            leverage: p.leverage,
        });

    let position_value = position.as_ref().map(|p| p.notional_value).unwrap_or(0.0);
    let unrealized_pnl = position.as_ref().map(|p| p.unrealized_pnl).unwrap_or(0.0);

    let metrics = PortfolioMetrics {
        total_balance: total,
        available_balance: available,
        position_value,
        unrealized_pnl,
        realized_pnl,
        total_pnl: realized_pnl + unrealized_pnl,
        position_ratio: safe_divide(position_value, total),
        leverage_ratio: safe_divide(position_value, available),
        margin_ratio: safe_divide(position_value - available, total),
    };
    Ok((metrics, position))
}

/// Spot holdings carry no cost basis here: the entry price is approximated by
/// the current price, so spot unrealized PnL is always zero.
async fn spot_metrics(
    exchange: &dyn Exchange,
    symbol: &str,
    realized_pnl: f64,
) -> Result<(PortfolioMetrics, Option<PositionInfo>)> {
    let (base, quote) = split_symbol(symbol);
    let balance = exchange
        .get_balance()
        .await
        .context("Failed to fetch spot balance")?;
    let price = exchange
        .get_ticker(symbol)
        .await
        .context("Failed to fetch spot price")?;

    let base_total = balance.total(base);
    let position_value = base_total * price;

    let mut total_value = balance.total(quote);
    for (asset, holding) in &balance.assets {
        if asset == quote || holding.total <= 0.0 {
            continue;
        }
        if asset == base {
            total_value += position_value;
            continue;
        }
        let pair = format!("{}/{}", asset, quote);
        match exchange.get_ticker(&pair).await {
            Ok(asset_price) => total_value += holding.total * asset_price,
            Err(e) => debug!("[PORTFOLIO] Skipping {} in valuation: {}", asset, e),
        }
    }

    let position = (base_total > 0.0).then(|| PositionInfo {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        size: base_total,
        entry_price: price,
        current_price: price,
        unrealized_pnl: 0.0,
        notional_value: position_value,
        leverage: 1,
    });

    let metrics = PortfolioMetrics {
        total_balance: total_value,
        available_balance: balance.free(quote),
        position_value,
        unrealized_pnl: 0.0,
        realized_pnl,
        total_pnl: realized_pnl,
        position_ratio: safe_divide(position_value, total_value),
        leverage_ratio: 1.0,
        margin_ratio: 0.0,
    };
    Ok((metrics, position))
}

pub struct PortfolioAccountant {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    realized: watch::Receiver<f64>,
    peak_value: f64,
    max_drawdown: f64,
    daily_start_value: f64,
    last_daily_reset: Option<DateTime<Utc>>,
}

impl PortfolioAccountant {
    /// `realized` carries the controller's running realized profit.
    pub fn new(exchange: Arc<dyn Exchange>, symbol: &str, realized: watch::Receiver<f64>) -> Self {
        Self {
            exchange,
            symbol: symbol.to_string(),
            realized,
            peak_value: 0.0,
            max_drawdown: 0.0,
            daily_start_value: 0.0,
            last_daily_reset: None,
        }
    }

    pub async fn update(&mut self, now: DateTime<Utc>) -> Result<PortfolioSnapshot> {
        let realized = *self.realized.borrow();
        let (metrics, position) =
            collect_metrics(self.exchange.as_ref(), &self.symbol, realized).await?;
        Ok(self.apply_valuation(metrics, position, now))
    }

    /// Folds a fresh valuation into peak, drawdown and daily tracking.
    pub fn apply_valuation(
        &mut self,
        metrics: PortfolioMetrics,
        position: Option<PositionInfo>,
        now: DateTime<Utc>,
    ) -> PortfolioSnapshot {
        let value = match self.exchange.mode() {
            TradingMode::Futures => metrics.total_balance + metrics.unrealized_pnl,
            TradingMode::Spot => metrics.total_balance,
        };

        if value > self.peak_value {
            self.peak_value = value;
        }
        let current_drawdown = if self.peak_value > 0.0 {
            ((value - self.peak_value) / self.peak_value).min(0.0)
        } else {
            0.0
        };
        self.max_drawdown = self.max_drawdown.min(current_drawdown);

        let reset_due = match self.last_daily_reset {
            None => true,
            Some(at) => (now - at).to_std().unwrap_or_default() >= DAILY_RESET_INTERVAL,
        };
        if reset_due {
            if self.last_daily_reset.is_some() {
                info!(
                    "[PORTFOLIO] Daily baseline reset: {:.2} -> {:.2}",
                    self.daily_start_value, value
                );
            }
            self.daily_start_value = value;
            self.last_daily_reset = Some(now);
        }
        let daily_pnl = safe_divide(value - self.daily_start_value, self.daily_start_value);

        PortfolioSnapshot {
            metrics,
            position,
            portfolio_value: value,
            peak_value: self.peak_value,
            current_drawdown,
            max_drawdown: self.max_drawdown,
            daily_start_value: self.daily_start_value,
            daily_pnl,
            updated_at: Some(now),
        }
    }

    /// Updates on `interval`, replacing the published snapshot each time.
    pub async fn run(mut self, interval: Duration, tx: watch::Sender<Arc<PortfolioSnapshot>>) {
        let mut timer = tokio::time::interval(interval);
        info!("[PORTFOLIO] Accountant started ({}s interval)", interval.as_secs());
        loop {
            timer.tick().await;
            match self.update(Utc::now()).await {
                Ok(snapshot) => {
                    debug!(
                        "[PORTFOLIO] value={:.2} ratio={:.3} drawdown={:.4} daily={:.4}",
                        snapshot.portfolio_value,
                        snapshot.metrics.position_ratio,
                        snapshot.current_drawdown,
                        snapshot.daily_pnl
                    );
                    tx.send_replace(Arc::new(snapshot));
                }
                Err(e) => warn!("[PORTFOLIO] Update failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::simulation::{BalanceMode, SimulationConfig};
    use crate::exchange::paper::PaperExchange;
    use crate::model::OrderSide;
    use chrono::Duration as ChronoDuration;

    fn paper(mode: TradingMode, balances: &[(&str, f64)], price: f64) -> Arc<PaperExchange> {
        let sim = SimulationConfig {
            balance_mode: BalanceMode::Override,
            balance_overrides: balances
                .iter()
                .map(|(a, v)| (a.to_string(), *v))
                .collect(),
            initial_price: price,
            random_walk_step_pct: 0.0,
            ..SimulationConfig::default()
        };
        Arc::new(PaperExchange::new("BNB/USDT", mode, 2, &sim))
    }

    fn accountant(exchange: Arc<PaperExchange>) -> PortfolioAccountant {
        let (_tx, rx) = watch::channel(0.0);
        PortfolioAccountant::new(exchange, "BNB/USDT", rx)
    }

    fn valued(total: f64) -> PortfolioMetrics {
        PortfolioMetrics {
            total_balance: total,
            ..PortfolioMetrics::default()
        }
    }

    #[tokio::test]
    async fn test_spot_metrics_value_minor_holdings_best_effort() {
        let ex = paper(
            TradingMode::Spot,
            &[("USDT", 1000.0), ("BNB", 2.0), ("ETH", 1.0), ("DOGE", 100.0)],
            250.0,
        );
        ex.set_price("ETH/USDT", 2000.0).unwrap();
        // DOGE has no price and is skipped.

        let (metrics, position) = collect_metrics(ex.as_ref(), "BNB/USDT", 0.0).await.unwrap();
        assert!((metrics.position_value - 500.0).abs() < 1e-9);
        assert!((metrics.total_balance - 3500.0).abs() < 1e-9);
        assert!((metrics.position_ratio - 500.0 / 3500.0).abs() < 1e-9);
        assert_eq!(metrics.leverage_ratio, 1.0);

        let position = position.unwrap();
        assert_eq!(position.entry_price, 250.0);
        assert_eq!(position.unrealized_pnl, 0.0);
    }

    #[tokio::test]
    async fn test_futures_metrics_ratios() {
        let ex = paper(TradingMode::Futures, &[("USDT", 1000.0)], 100.0);
        ex.create_market_order("BNB/USDT", OrderSide::Buy, 4.0)
            .await
            .unwrap();
        ex.set_price("BNB/USDT", 110.0).unwrap();

        let (metrics, position) = collect_metrics(ex.as_ref(), "BNB/USDT", 5.0).await.unwrap();
        assert!((metrics.position_value - 440.0).abs() < 1e-9);
        assert!((metrics.unrealized_pnl - 40.0).abs() < 1e-9);
        assert!((metrics.total_pnl - 45.0).abs() < 1e-9);
        assert!((metrics.position_ratio - 0.44).abs() < 1e-9);
        assert!((metrics.leverage_ratio - 0.44).abs() < 1e-9);
        assert!((metrics.margin_ratio - (440.0 - 1000.0) / 1000.0).abs() < 1e-9);
        assert_eq!(position.unwrap().side, PositionSide::Long);
    }

    #[test]
    fn test_drawdown_tracks_peak_and_never_positive() {
        let ex = paper(TradingMode::Spot, &[("USDT", 0.0)], 1.0);
        let mut acc = accountant(ex);
        let now = Utc::now();

        let s = acc.apply_valuation(valued(1000.0), None, now);
        assert_eq!(s.current_drawdown, 0.0);

        let s = acc.apply_valuation(valued(900.0), None, now);
        assert!((s.current_drawdown + 0.1).abs() < 1e-9);
        assert!((s.peak_value - 1000.0).abs() < 1e-9);

        let s = acc.apply_valuation(valued(1200.0), None, now);
        assert_eq!(s.current_drawdown, 0.0);
        assert!((s.peak_value - 1200.0).abs() < 1e-9);
        // Max drawdown remembers the worst point.
        assert!((s.max_drawdown + 0.1).abs() < 1e-9);

        let s = acc.apply_valuation(valued(1100.0), None, now);
        assert!(s.current_drawdown < 0.0);
        assert!((s.peak_value - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_baseline_resets_after_a_day() {
        let ex = paper(TradingMode::Spot, &[("USDT", 0.0)], 1.0);
        let mut acc = accountant(ex);
        let start = Utc::now();

        acc.apply_valuation(valued(1000.0), None, start);
        let s = acc.apply_valuation(valued(950.0), None, start + ChronoDuration::hours(12));
        assert!((s.daily_pnl + 0.05).abs() < 1e-9);
        assert!((s.daily_start_value - 1000.0).abs() < 1e-9);

        let s = acc.apply_valuation(valued(940.0), None, start + ChronoDuration::hours(25));
        assert_eq!(s.daily_pnl, 0.0);
        assert!((s.daily_start_value - 940.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_reads_realized_profit() {
        let ex = paper(TradingMode::Spot, &[("USDT", 500.0), ("BNB", 1.0)], 500.0);
        let (tx, rx) = watch::channel(0.0);
        let mut acc = PortfolioAccountant::new(ex, "BNB/USDT", rx);
        tx.send_replace(12.5);

        let snapshot = acc.update(Utc::now()).await.unwrap();
        assert!((snapshot.metrics.realized_pnl - 12.5).abs() < 1e-9);
        assert!((snapshot.metrics.position_ratio - 0.5).abs() < 1e-9);
        assert!(snapshot.updated_at.is_some());
    }
}

use super::common::{breakout_direction, rolling_range};
use super::types::{SignalAction, StrategySignal};
use super::Strategy;
use crate::config::strategy::BreakoutConfig;
use crate::constants::BREAKOUT_REFRESH_INTERVAL;
use crate::engine::state::GridState;
use crate::exchange::Exchange;
use crate::model::OrderHandle;
use crate::portfolio::collect_metrics;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
struct BreakoutLevels {
    high: f64,
    low: f64,
    computed_at: DateTime<Utc>,
}

/// Rebalances toward a target position ratio when price leaves the rolling
/// N-day high/low range.
pub struct BreakoutStrategy {
    config: BreakoutConfig,
    symbol: String,
    exchange: Arc<dyn Exchange>,
    levels: Option<BreakoutLevels>,
    last_signal_at: Option<DateTime<Utc>>,
}

impl BreakoutStrategy {
    pub fn new(config: BreakoutConfig, symbol: &str, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            config,
            symbol: symbol.to_string(),
            exchange,
            levels: None,
            last_signal_at: None,
        }
    }

    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        let min_interval = Duration::from_secs(self.config.min_adjustment_interval);
        self.last_signal_at
            .map(|at| (now - at).to_std().unwrap_or_default() < min_interval)
            .unwrap_or(false)
    }

    async fn refresh_levels(&mut self, now: DateTime<Utc>) -> Result<Option<BreakoutLevels>> {
        let stale = match self.levels {
            None => true,
            Some(l) => (now - l.computed_at).to_std().unwrap_or_default() >= BREAKOUT_REFRESH_INTERVAL,
        };
        if !stale {
            return Ok(self.levels);
        }

        let lookback = self.config.lookback_days;
        let candles = self
            .exchange
            .get_klines(&self.symbol, lookback + 2)
            .await
            .context("Failed to fetch daily candles")?;

        match rolling_range(&candles, lookback) {
            Some((high, low)) => {
                info!(
                    "[BREAKOUT] {}-day range for {}: high {:.4} low {:.4}",
                    lookback, self.symbol, high, low
                );
                self.levels = Some(BreakoutLevels {
                    high,
                    low,
                    computed_at: now,
                });
            }
            None => warn!(
                "[BREAKOUT] Need {} completed days, exchange returned {} candles",
                lookback,
                candles.len()
            ),
        }
        Ok(self.levels)
    }
}

#[async_trait]
impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        "breakout"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    async fn evaluate(&mut self, state: &GridState, now: DateTime<Utc>) -> Result<StrategySignal> {
        if !self.config.enabled {
            return Ok(StrategySignal::hold("disabled"));
        }
        if self.cooling_down(now) {
            return Ok(StrategySignal::hold("cooldown"));
        }
        let price = state.current_price;
        if price <= 0.0 {
            return Ok(StrategySignal::hold("no price"));
        }
        let Some(levels) = self.refresh_levels(now).await? else {
            return Ok(StrategySignal::hold("insufficient history"));
        };

        let (metrics, _) = collect_metrics(self.exchange.as_ref(), &self.symbol, 0.0).await?;
        let ratio = metrics.position_ratio;

        let (action, target, reason) = match breakout_direction(price, levels.high, levels.low) {
            1 if ratio > self.config.sell_target_percent => (
                SignalAction::Sell,
                self.config.sell_target_percent,
                format!(
                    "Price {:.4} above {}-day high {:.4}, position {:.1}% > target {:.1}%",
                    price,
                    self.config.lookback_days,
                    levels.high,
                    ratio * 100.0,
                    self.config.sell_target_percent * 100.0
                ),
            ),
            -1 if ratio < self.config.buy_target_percent => (
                SignalAction::Buy,
                self.config.buy_target_percent,
                format!(
                    "Price {:.4} below {}-day low {:.4}, position {:.1}% < target {:.1}%",
                    price,
                    self.config.lookback_days,
                    levels.low,
                    ratio * 100.0,
                    self.config.buy_target_percent * 100.0
                ),
            ),
            _ => {
                debug!(
                    "[BREAKOUT] No signal: price {:.4} range [{:.4}, {:.4}] ratio {:.3}",
                    price, levels.low, levels.high, ratio
                );
                return Ok(StrategySignal::hold("inside range"));
            }
        };

        self.last_signal_at = Some(now);
        Ok(StrategySignal {
            action,
            price,
            current_ratio: ratio,
            target_ratio: target,
            total_value: metrics.total_balance,
            reason,
        })
    }

    async fn execute_adjustment(&mut self, signal: &StrategySignal) -> Result<Option<OrderHandle>> {
        if !self.config.execute_adjustments {
            return Ok(None);
        }
        let Some(side) = signal.action.side() else {
            return Ok(None);
        };
        let amount = self
            .exchange
            .adjust_amount_precision(&self.symbol, signal.adjustment_amount());
        if amount <= 0.0 {
            return Err(anyhow!("Adjustment amount rounds to zero"));
        }
        let handle = self
            .exchange
            .create_market_order(&self.symbol, side, amount)
            .await?;
        info!(
            "[BREAKOUT] Rebalance {} {:.6} {} toward {:.1}%",
            side,
            amount,
            self.symbol,
            signal.target_ratio * 100.0
        );
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::simulation::{BalanceMode, SimulationConfig};
    use crate::exchange::paper::PaperExchange;
    use crate::model::{Candle, TradingMode};
    use crate::strategy::common::testing::daily_candles;
    use chrono::Duration as ChronoDuration;

    fn history(lookback: usize, forming: (f64, f64)) -> Vec<Candle> {
        let mut ranges = vec![(110.0, 90.0); lookback];
        ranges.push(forming);
        daily_candles(&ranges)
    }

    fn setup(
        balances: &[(&str, f64)],
        price: f64,
        config: BreakoutConfig,
    ) -> (BreakoutStrategy, Arc<PaperExchange>, GridState) {
        let sim = SimulationConfig {
            balance_mode: BalanceMode::Override,
            balance_overrides: balances.iter().map(|(a, v)| (a.to_string(), *v)).collect(),
            initial_price: price,
            random_walk_step_pct: 0.0,
            ..SimulationConfig::default()
        };
        let exchange = Arc::new(PaperExchange::new("BNB/USDT", TradingMode::Spot, 1, &sim));
        exchange
            .set_candles(history(config.lookback_days, (price, price)))
            .unwrap();
        let strategy = BreakoutStrategy::new(config, "BNB/USDT", exchange.clone());
        let mut state = GridState::new(2.0);
        state.record_price(price);
        (strategy, exchange, state)
    }

    fn config(lookback: usize) -> BreakoutConfig {
        BreakoutConfig {
            lookback_days: lookback,
            ..BreakoutConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sell_signal_above_high_when_overweight() {
        // 8 BNB at 120 = 960 vs 240 USDT -> ratio 0.8
        let (mut strategy, _ex, state) =
            setup(&[("USDT", 240.0), ("BNB", 8.0)], 120.0, config(5));
        let now = Utc::now();

        let signal = strategy.evaluate(&state, now).await.unwrap();
        assert_eq!(signal.action, SignalAction::Sell);
        assert!((signal.current_ratio - 0.8).abs() < 1e-9);
        assert!((signal.target_ratio - 0.5).abs() < 1e-9);
        // 1200 * 0.3 / 120
        assert!((signal.adjustment_amount() - 3.0).abs() < 1e-9);

        // Cooldown starts at the signal.
        let again = strategy.evaluate(&state, now + ChronoDuration::seconds(10)).await.unwrap();
        assert_eq!(again.action, SignalAction::Hold);
        assert_eq!(again.reason, "cooldown");
    }

    #[tokio::test]
    async fn test_buy_signal_below_low_when_underweight() {
        // 1 BNB at 80 vs 920 USDT -> ratio 0.08
        let (mut strategy, _ex, state) =
            setup(&[("USDT", 920.0), ("BNB", 1.0)], 80.0, config(5));
        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert!((signal.target_ratio - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_signal_when_ratio_already_on_target_side() {
        // Above the high but ratio 0.2 < sell target.
        let (mut strategy, _ex, state) =
            setup(&[("USDT", 960.0), ("BNB", 2.0)], 120.0, config(5));
        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
        assert!(strategy.last_signal_at.is_none());
    }

    #[tokio::test]
    async fn test_disabled_returns_hold_without_work() {
        let (mut strategy, exchange, state) =
            setup(&[("USDT", 240.0), ("BNB", 8.0)], 120.0, config(5));
        strategy.set_enabled(false);
        // Without candles any real evaluation would fail.
        exchange.set_candles(Vec::new()).unwrap();
        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.reason, "disabled");
        assert!(strategy.levels.is_none());
    }

    #[tokio::test]
    async fn test_insufficient_history_holds() {
        let (mut strategy, exchange, state) =
            setup(&[("USDT", 240.0), ("BNB", 8.0)], 120.0, config(5));
        exchange.set_candles(history(3, (120.0, 120.0))).unwrap();
        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        assert_eq!(signal.reason, "insufficient history");
    }

    #[tokio::test]
    async fn test_levels_refresh_daily() {
        let (mut strategy, exchange, state) =
            setup(&[("USDT", 960.0), ("BNB", 2.0)], 100.0, config(5));
        let start = Utc::now();
        strategy.evaluate(&state, start).await.unwrap();
        assert_eq!(strategy.levels.map(|l| l.high), Some(110.0));

        let mut wider = vec![(150.0, 50.0); 5];
        wider.push((100.0, 100.0));
        exchange.set_candles(daily_candles(&wider)).unwrap();

        strategy.evaluate(&state, start + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(strategy.levels.map(|l| l.high), Some(110.0));

        strategy.evaluate(&state, start + ChronoDuration::hours(24)).await.unwrap();
        assert_eq!(strategy.levels.map(|l| l.high), Some(150.0));
    }

    #[tokio::test]
    async fn test_execute_adjustment_places_market_order() {
        let mut cfg = config(5);
        cfg.execute_adjustments = true;
        let (mut strategy, exchange, state) = setup(&[("USDT", 240.0), ("BNB", 8.0)], 120.0, cfg);

        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        let handle = strategy.execute_adjustment(&signal).await.unwrap().unwrap();
        assert_eq!(handle.side, crate::model::OrderSide::Sell);
        assert!((handle.amount - 3.0).abs() < 1e-9);

        let balance = exchange.get_balance().await.unwrap();
        assert!((balance.total("BNB") - 5.0).abs() < 1e-9);
        assert!((balance.total("USDT") - 600.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_adjustment_respects_flag() {
        let (mut strategy, exchange, state) =
            setup(&[("USDT", 240.0), ("BNB", 8.0)], 120.0, config(5));
        let signal = strategy.evaluate(&state, Utc::now()).await.unwrap();
        assert!(strategy.execute_adjustment(&signal).await.unwrap().is_none());
        assert_eq!(exchange.open_order_count(), 0);
    }
}

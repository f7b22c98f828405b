//! In-memory paper exchange.
//!
//! Limit orders lock balance on placement and fill at their limit price once
//! the market trades through them. Spot mode moves base and quote balances;
//! futures mode keeps a signed position with a weighted entry price and books
//! realized PnL into the quote balance when the position is reduced.

use crate::config::simulation::SimulationConfig;
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{
    split_symbol, AssetBalance, BalanceSnapshot, Candle, OrderHandle, OrderSide, OrderStatus,
    OrderStatusReport, PositionSide, PositionSnapshot, TradingMode,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

struct PaperOrder {
    handle: OrderHandle,
    status: OrderStatus,
    filled_amount: f64,
    avg_price: f64,
    /// Quote (buy, or futures margin) or base (spot sell) held for this order.
    locked: f64,
}

#[derive(Default)]
struct FuturesPosition {
    /// Positive long, negative short.
    size: f64,
    entry_price: f64,
}

struct PaperBook {
    price: f64,
    other_prices: HashMap<String, f64>,
    balances: HashMap<String, AssetBalance>,
    orders: HashMap<String, PaperOrder>,
    candles: Vec<Candle>,
    position: FuturesPosition,
}

pub struct PaperExchange {
    symbol: String,
    base: String,
    quote: String,
    mode: TradingMode,
    leverage: u32,
    amount_decimals: u32,
    price_decimals: u32,
    walk_step_pct: f64,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(symbol: &str, mode: TradingMode, leverage: u32, sim: &SimulationConfig) -> Self {
        let (base, quote) = split_symbol(symbol);
        let balances = sim
            .starting_balances(base, quote)
            .into_iter()
            .filter(|(asset, _)| mode == TradingMode::Spot || asset == quote)
            .map(|(asset, amount)| {
                (
                    asset,
                    AssetBalance {
                        free: amount,
                        total: amount,
                    },
                )
            })
            .collect();

        info!(
            "[PAPER] {} {} market opened at {:.4}",
            symbol, mode, sim.initial_price
        );

        Self {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            mode,
            leverage: leverage.max(1),
            amount_decimals: sim.amount_decimals,
            price_decimals: sim.price_decimals,
            walk_step_pct: sim.random_walk_step_pct,
            book: Mutex::new(PaperBook {
                price: sim.initial_price,
                other_prices: HashMap::new(),
                balances,
                orders: HashMap::new(),
                candles: synthesize_history(sim.initial_price, sim.history_days, Utc::now()),
                position: FuturesPosition::default(),
            }),
        }
    }

    fn book(&self) -> Result<MutexGuard<'_, PaperBook>> {
        self.book
            .lock()
            .map_err(|_| anyhow!("paper exchange state is poisoned"))
    }

    /// Moves the market. Resting orders crossed by the new price fill.
    pub fn set_price(&self, symbol: &str, price: f64) -> Result<()> {
        let mut book = self.book()?;
        if symbol == self.symbol {
            self.apply_price(&mut book, price, Utc::now());
        } else {
            book.other_prices.insert(symbol.to_string(), price);
        }
        Ok(())
    }

    pub fn set_balance(&self, asset: &str, free: f64, total: f64) -> Result<()> {
        self.book()?
            .balances
            .insert(asset.to_string(), AssetBalance { free, total });
        Ok(())
    }

    pub fn set_candles(&self, candles: Vec<Candle>) -> Result<()> {
        self.book()?.candles = candles;
        Ok(())
    }

    pub fn open_order_count(&self) -> usize {
        self.book()
            .map(|b| {
                b.orders
                    .values()
                    .filter(|o| o.status == OrderStatus::Open)
                    .count()
            })
            .unwrap_or(0)
    }

    fn ensure_symbol(&self, symbol: &str) -> Result<()> {
        if symbol == self.symbol {
            Ok(())
        } else {
            Err(ExchangeError::UnknownSymbol(symbol.to_string()).into())
        }
    }

    fn apply_price(&self, book: &mut PaperBook, price: f64, now: DateTime<Utc>) {
        book.price = price;
        roll_candles(&mut book.candles, price, now);

        let crossed: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.status == OrderStatus::Open)
            .filter(|(_, o)| match o.handle.side {
                OrderSide::Buy => price <= o.handle.price,
                OrderSide::Sell => price >= o.handle.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in crossed {
            self.fill(book, &id);
        }
    }

    fn fill(&self, book: &mut PaperBook, id: &str) {
        let Some(order) = book.orders.get_mut(id) else {
            return;
        };
        let side = order.handle.side;
        let amount = order.handle.amount;
        let price = order.handle.price;
        let locked = order.locked;
        order.status = OrderStatus::Closed;
        order.filled_amount = amount;
        order.avg_price = price;

        debug!("[PAPER] Filled {} {} @ {}", side, amount, price);

        match self.mode {
            TradingMode::Spot => {
                let notional = amount * price;
                match side {
                    OrderSide::Buy => {
                        let quote = book.balances.entry(self.quote.clone()).or_default();
                        quote.total -= locked;
                        quote.free += locked - notional;
                        let base = book.balances.entry(self.base.clone()).or_default();
                        base.free += amount;
                        base.total += amount;
                    }
                    OrderSide::Sell => {
                        let base = book.balances.entry(self.base.clone()).or_default();
                        base.total -= locked;
                        let quote = book.balances.entry(self.quote.clone()).or_default();
                        quote.free += notional;
                        quote.total += notional;
                    }
                }
            }
            TradingMode::Futures => {
                let quote = book.balances.entry(self.quote.clone()).or_default();
                quote.free += locked;
                let signed = if side.is_buy() { amount } else { -amount };
                let realized = apply_to_position(&mut book.position, signed, price);
                let quote = book.balances.entry(self.quote.clone()).or_default();
                quote.free += realized;
                quote.total += realized;
            }
        }
    }

    /// Balance reserved by a new order: (asset, amount).
    fn reservation(&self, side: OrderSide, amount: f64, price: f64) -> (String, f64) {
        match (self.mode, side) {
            (TradingMode::Futures, _) => (self.quote.clone(), amount * price / self.leverage as f64),
            (TradingMode::Spot, OrderSide::Buy) => (self.quote.clone(), amount * price),
            (TradingMode::Spot, OrderSide::Sell) => (self.base.clone(), amount),
        }
    }

    fn release(&self, book: &mut PaperBook, id: &str) {
        let Some(order) = book.orders.get_mut(id) else {
            return;
        };
        order.status = OrderStatus::Canceled;
        let (asset, _) = self.reservation(order.handle.side, order.handle.amount, order.handle.price);
        let locked = order.locked;
        book.balances.entry(asset).or_default().free += locked;
    }

    fn submit(
        &self,
        book: &mut PaperBook,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderHandle> {
        if amount <= 0.0 || price <= 0.0 {
            return Err(anyhow!(
                "Invalid order: amount {} price {} must be positive",
                amount,
                price
            ));
        }
        let (asset, required) = self.reservation(side, amount, price);
        let balance = book.balances.entry(asset.clone()).or_default();
        if balance.free + 1e-12 < required {
            return Err(ExchangeError::InsufficientBalance {
                asset,
                required,
                available: balance.free,
            }
            .into());
        }
        balance.free -= required;

        let handle = OrderHandle {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: self.symbol.clone(),
            side,
            price,
            amount,
        };
        book.orders.insert(
            handle.id.clone(),
            PaperOrder {
                handle: handle.clone(),
                status: OrderStatus::Open,
                filled_amount: 0.0,
                avg_price: 0.0,
                locked: required,
            },
        );
        Ok(handle)
    }
}

/// Applies a signed fill to the position and returns realized PnL.
fn apply_to_position(position: &mut FuturesPosition, signed: f64, price: f64) -> f64 {
    let same_direction = position.size == 0.0 || position.size.signum() == signed.signum();
    if same_direction {
        let new_size = position.size + signed;
        position.entry_price =
            (position.entry_price * position.size.abs() + price * signed.abs()) / new_size.abs();
        position.size = new_size;
        return 0.0;
    }

    let closed = signed.abs().min(position.size.abs());
    let realized = closed * (price - position.entry_price) * position.size.signum();
    let remainder = signed.abs() - closed;
    if remainder > 0.0 {
        position.size = remainder * signed.signum();
        position.entry_price = price;
    } else {
        position.size += signed;
        if position.size.abs() < 1e-12 {
            position.size = 0.0;
            position.entry_price = 0.0;
        }
    }
    realized
}

/// Updates the forming candle, opening a new one on a new UTC day.
fn roll_candles(candles: &mut Vec<Candle>, price: f64, now: DateTime<Utc>) {
    let today = now.date_naive();
    match candles.last_mut() {
        Some(last) if last.open_time.date_naive() == today => {
            last.high = last.high.max(price);
            last.low = last.low.min(price);
            last.close = price;
        }
        _ => {
            let open_time = today
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now);
            candles.push(Candle {
                open_time,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 0.0,
            });
        }
    }
}

/// Random daily history ending with today's forming candle at `price`.
fn synthesize_history(price: f64, days: usize, now: DateTime<Utc>) -> Vec<Candle> {
    let mut rng = rand::thread_rng();
    let mut candles = Vec::with_capacity(days + 1);
    let mut close = price;
    for day in 1..=days {
        let open = close / (1.0 + rng.gen_range(-0.03..=0.03));
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..=0.015));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..=0.015));
        candles.push(Candle {
            open_time: now - ChronoDuration::days(day as i64),
            open,
            high,
            low,
            close,
            volume: rng.gen_range(1_000.0..=10_000.0),
        });
        close = open;
    }
    candles.reverse();
    roll_candles(&mut candles, price, now);
    candles
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    fn mode(&self) -> TradingMode {
        self.mode
    }

    async fn get_ticker(&self, symbol: &str) -> Result<f64> {
        let mut book = self.book()?;
        if symbol != self.symbol {
            return book
                .other_prices
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()).into());
        }
        if self.walk_step_pct > 0.0 {
            let step = rand::thread_rng().gen_range(-self.walk_step_pct..=self.walk_step_pct);
            let next = book.price * (1.0 + step / 100.0);
            self.apply_price(&mut book, next, Utc::now());
        }
        if book.price <= 0.0 {
            return Err(ExchangeError::MarketData(format!("no price for {}", symbol)).into());
        }
        Ok(book.price)
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        price: f64,
    ) -> Result<OrderHandle> {
        self.ensure_symbol(symbol)?;
        let mut book = self.book()?;
        let handle = self.submit(&mut book, side, amount, price)?;
        let market = book.price;
        let marketable = match side {
            OrderSide::Buy => market <= price,
            OrderSide::Sell => market >= price,
        };
        if marketable {
            self.fill(&mut book, &handle.id);
        }
        Ok(handle)
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
    ) -> Result<OrderHandle> {
        self.ensure_symbol(symbol)?;
        let mut book = self.book()?;
        let price = book.price;
        let handle = self.submit(&mut book, side, amount, price)?;
        self.fill(&mut book, &handle.id);
        Ok(handle)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<()> {
        self.ensure_symbol(symbol)?;
        let mut book = self.book()?;
        let status = book
            .orders
            .get(id)
            .map(|o| o.status)
            .ok_or_else(|| ExchangeError::OrderNotFound(id.to_string()))?;
        if status != OrderStatus::Open {
            return Err(anyhow!("Order {} is no longer open ({:?})", id, status));
        }
        self.release(&mut book, id);
        Ok(())
    }

    async fn get_order_status(&self, id: &str, symbol: &str) -> Result<OrderStatusReport> {
        self.ensure_symbol(symbol)?;
        let mut book = self.book()?;
        let order = book
            .orders
            .get(id)
            .ok_or_else(|| ExchangeError::OrderNotFound(id.to_string()))?;
        let report = OrderStatusReport {
            id: id.to_string(),
            status: order.status,
            filled_amount: order.filled_amount,
            avg_price: order.avg_price,
        };
        // A terminal status is reported once, then the order leaves the book.
        if report.status != OrderStatus::Open {
            book.orders.remove(id);
        }
        Ok(report)
    }

    async fn get_balance(&self) -> Result<BalanceSnapshot> {
        Ok(BalanceSnapshot {
            assets: self.book()?.balances.clone(),
        })
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionSnapshot>> {
        self.ensure_symbol(symbol)?;
        if self.mode == TradingMode::Spot {
            return Ok(None);
        }
        let book = self.book()?;
        let position = &book.position;
        if position.size == 0.0 {
            return Ok(None);
        }
        let side = if position.size > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        Ok(Some(PositionSnapshot {
            side,
            size: position.size.abs(),
            entry_price: position.entry_price,
            mark_price: book.price,
            notional: position.size.abs() * book.price,
            unrealized_pnl: (book.price - position.entry_price) * position.size,
            leverage: self.leverage,
        }))
    }

    async fn get_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        self.ensure_symbol(symbol)?;
        let book = self.book()?;
        let start = book.candles.len().saturating_sub(limit);
        Ok(book.candles[start..].to_vec())
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize> {
        if let Some(s) = symbol {
            self.ensure_symbol(s)?;
        }
        let mut book = self.book()?;
        let open: Vec<String> = book
            .orders
            .iter()
            .filter(|(_, o)| o.status == OrderStatus::Open)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &open {
            self.release(&mut book, id);
        }
        Ok(open.len())
    }

    async fn get_account_value(&self) -> Result<f64> {
        let book = self.book()?;
        match self.mode {
            TradingMode::Futures => {
                let unrealized =
                    (book.price - book.position.entry_price) * book.position.size;
                Ok(book
                    .balances
                    .get(&self.quote)
                    .map(|b| b.total)
                    .unwrap_or(0.0)
                    + unrealized)
            }
            TradingMode::Spot => {
                let mut value = 0.0;
                for (asset, balance) in &book.balances {
                    if *asset == self.quote {
                        value += balance.total;
                    } else if *asset == self.base {
                        value += balance.total * book.price;
                    } else if let Some(price) =
                        book.other_prices.get(&format!("{}/{}", asset, self.quote))
                    {
                        value += balance.total * price;
                    }
                }
                Ok(value)
            }
        }
    }

    fn adjust_amount_precision(&self, _symbol: &str, amount: f64) -> f64 {
        round_to_decimals(amount, self.amount_decimals)
    }

    fn adjust_price_precision(&self, _symbol: &str, price: f64) -> f64 {
        round_to_decimals(price, self.price_decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::simulation::BalanceMode;

    fn spot_exchange(usdt: f64, bnb: f64) -> PaperExchange {
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), usdt);
        balances.insert("BNB".to_string(), bnb);
        let sim = SimulationConfig {
            balance_mode: BalanceMode::Override,
            balance_overrides: balances,
            initial_price: 300.0,
            random_walk_step_pct: 0.0,
            ..SimulationConfig::default()
        };
        PaperExchange::new("BNB/USDT", TradingMode::Spot, 1, &sim)
    }

    #[tokio::test]
    async fn test_buy_locks_quote_and_fills_when_crossed() {
        let ex = spot_exchange(1000.0, 0.0);
        let order = ex
            .create_limit_order("BNB/USDT", OrderSide::Buy, 1.0, 290.0)
            .await
            .unwrap();

        let balance = ex.get_balance().await.unwrap();
        assert!((balance.free("USDT") - 710.0).abs() < 1e-9);
        assert!((balance.total("USDT") - 1000.0).abs() < 1e-9);

        ex.set_price("BNB/USDT", 295.0).unwrap();
        let status = ex.get_order_status(&order.id, "BNB/USDT").await.unwrap();
        assert_eq!(status.status, OrderStatus::Open);

        ex.set_price("BNB/USDT", 289.0).unwrap();
        let status = ex.get_order_status(&order.id, "BNB/USDT").await.unwrap();
        assert_eq!(status.status, OrderStatus::Closed);
        assert!((status.avg_price - 290.0).abs() < 1e-9);

        let balance = ex.get_balance().await.unwrap();
        assert!((balance.total("USDT") - 710.0).abs() < 1e-9);
        assert!((balance.total("BNB") - 1.0).abs() < 1e-9);

        // Reported fills are pruned from the book.
        let err = ex.get_order_status(&order.id, "BNB/USDT").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExchangeError>(),
            Some(ExchangeError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_orders_leave_book_once_reported() {
        let ex = spot_exchange(1000.0, 0.0);
        let order = ex
            .create_limit_order("BNB/USDT", OrderSide::Buy, 1.0, 290.0)
            .await
            .unwrap();
        ex.cancel_order(&order.id, "BNB/USDT").await.unwrap();
        assert_eq!(ex.book().unwrap().orders.len(), 1);

        let status = ex.get_order_status(&order.id, "BNB/USDT").await.unwrap();
        assert_eq!(status.status, OrderStatus::Canceled);
        assert!(ex.book().unwrap().orders.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let ex = spot_exchange(100.0, 0.0);
        let err = ex
            .create_limit_order("BNB/USDT", OrderSide::Buy, 1.0, 290.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExchangeError>(),
            Some(ExchangeError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_releases_balances() {
        let ex = spot_exchange(1000.0, 2.0);
        ex.create_limit_order("BNB/USDT", OrderSide::Buy, 1.0, 290.0)
            .await
            .unwrap();
        ex.create_limit_order("BNB/USDT", OrderSide::Sell, 1.0, 310.0)
            .await
            .unwrap();
        assert_eq!(ex.open_order_count(), 2);

        assert_eq!(ex.cancel_all_orders(Some("BNB/USDT")).await.unwrap(), 2);
        assert_eq!(ex.open_order_count(), 0);

        let balance = ex.get_balance().await.unwrap();
        assert!((balance.free("USDT") - 1000.0).abs() < 1e-9);
        assert!((balance.free("BNB") - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_futures_position_and_realized_pnl() {
        let sim = SimulationConfig {
            balance_mode: BalanceMode::Override,
            balance_overrides: [("USDT".to_string(), 10_000.0)].into_iter().collect(),
            initial_price: 100.0,
            random_walk_step_pct: 0.0,
            ..SimulationConfig::default()
        };
        let ex = PaperExchange::new("BTC/USDT", TradingMode::Futures, 5, &sim);

        ex.create_market_order("BTC/USDT", OrderSide::Buy, 2.0)
            .await
            .unwrap();
        ex.set_price("BTC/USDT", 110.0).unwrap();

        let position = ex.get_position("BTC/USDT").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Long);
        assert!((position.unrealized_pnl - 20.0).abs() < 1e-9);
        assert!((ex.get_account_value().await.unwrap() - 10_020.0).abs() < 1e-9);

        ex.create_market_order("BTC/USDT", OrderSide::Sell, 2.0)
            .await
            .unwrap();
        assert!(ex.get_position("BTC/USDT").await.unwrap().is_none());
        let balance = ex.get_balance().await.unwrap();
        assert!((balance.total("USDT") - 10_020.0).abs() < 1e-9);
        assert!((balance.free("USDT") - 10_020.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_klines_end_with_forming_day() {
        let ex = spot_exchange(0.0, 0.0);
        let klines = ex.get_klines("BNB/USDT", 10).await.unwrap();
        assert_eq!(klines.len(), 10);
        let last = klines.last().unwrap();
        assert_eq!(last.open_time.date_naive(), Utc::now().date_naive());
        assert!(klines.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[test]
    fn test_precision_rounding() {
        let ex = spot_exchange(0.0, 0.0);
        assert!((ex.adjust_amount_precision("BNB/USDT", 0.1234567) - 0.123457).abs() < 1e-12);
        assert!((ex.adjust_price_precision("BNB/USDT", 98.123456) - 98.1235).abs() < 1e-12);
    }
}

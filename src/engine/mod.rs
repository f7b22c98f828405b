//! Grid controller.
//!
//! One [`GridEngine`] drives one symbol. Each tick refreshes the price,
//! adapts the grid size to volatility, maintains the level table, places
//! orders on eligible levels and reconciles outstanding ones. The portfolio
//! accountant and risk evaluator run as separate tasks and share state with
//! the controller only through `watch` snapshots and the emergency stop.

pub mod levels;
pub mod state;

use crate::broadcast::types::format_uptime;
use crate::broadcast::{
    EngineStatus, GridLevelsView, LevelInfo, MarketEvent, OrderEvent, StatusBroadcaster, WSEvent,
};
use crate::config::BotConfig;
use crate::constants::{
    BUY_GUARD_MULTIPLIER, MIN_NOTIONAL_TOLERANCE, ORDER_BALANCE_FRACTION, SELL_GUARD_MULTIPLIER,
    STATUS_BROADCAST_INTERVAL,
};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{
    split_symbol, OrderHandle, OrderSide, OrderStatus, OrderStatusReport, PositionSide, TradeRecord,
    TradingMode,
};
use crate::persistence::{resolve_base_price, PersistedState, StateStore};
use crate::portfolio::{PortfolioAccountant, PortfolioSnapshot};
use crate::reporter::Notifier;
use crate::risk::{AlertHistory, EmergencyStop, RiskEvaluator};
use crate::strategy::StrategyManager;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use levels::{GridLevelTable, PriceKey};
use log::{debug, error, info, warn};
use state::{adjustment_due, grid_size_for_volatility, GridState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Realized profit of a grid fill. Buys realize nothing at fill time.
pub fn fill_profit(side: OrderSide, fill_price: f64, base_price: f64, amount: f64) -> f64 {
    match side {
        OrderSide::Sell => (fill_price - base_price) * amount,
        OrderSide::Buy => 0.0,
    }
}

/// Directional guard: never place a level order that would execute
/// immediately against the current price.
pub fn passes_guard(side: OrderSide, level_price: f64, current_price: f64) -> bool {
    match side {
        OrderSide::Buy => level_price < current_price * BUY_GUARD_MULTIPLIER,
        OrderSide::Sell => level_price > current_price * SELL_GUARD_MULTIPLIER,
    }
}

/// Shared handles the controller is built from.
pub struct EngineDeps {
    pub exchange: Arc<dyn Exchange>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn StateStore>,
    pub broadcaster: StatusBroadcaster,
    pub emergency: EmergencyStop,
    pub alerts: AlertHistory,
}

pub struct GridEngine {
    config: BotConfig,
    symbol: String,
    deps: EngineDeps,
    strategies: StrategyManager,
    state: GridState,
    levels: GridLevelTable,
    /// Level key -> resting order. Owned by the controller only.
    active_orders: BTreeMap<PriceKey, OrderHandle>,
    total_profit: f64,
    trade_count: u64,
    profit_tx: watch::Sender<f64>,
    started_at: Instant,
    last_save: Option<DateTime<Utc>>,
    is_running: bool,
}

impl GridEngine {
    pub fn new(config: BotConfig, deps: EngineDeps) -> Result<Self> {
        let symbol = config.symbol().to_string();
        let strategies = StrategyManager::from_config(
            &config.strategies,
            &symbol,
            deps.exchange.clone(),
            deps.notifier.clone(),
            deps.emergency.clone(),
        )?;
        let (profit_tx, _) = watch::channel(0.0);
        Ok(Self {
            state: GridState::new(config.grid.initial_size),
            levels: GridLevelTable::new(Duration::from_secs(config.grid.level_cooldown_secs)),
            symbol,
            deps,
            strategies,
            active_orders: BTreeMap::new(),
            total_profit: 0.0,
            trade_count: 0,
            profit_tx,
            started_at: Instant::now(),
            last_save: None,
            is_running: false,
            config,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn levels(&self) -> &GridLevelTable {
        &self.levels
    }

    pub fn emergency(&self) -> &EmergencyStop {
        &self.deps.emergency
    }

    /// Receiver for the running realized profit, read by the accountant.
    pub fn profit_feed(&self) -> watch::Receiver<f64> {
        self.profit_tx.subscribe()
    }

    pub fn total_profit(&self) -> f64 {
        self.total_profit
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    /// Restores persisted state, or starts fresh from configuration.
    ///
    /// A fresh start with no configured base price leaves the base at zero
    /// so the first tick seeds it from the market.
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> Result<()> {
        let saved = match self.deps.store.load_state() {
            Ok(saved) => saved,
            Err(e) => {
                warn!("[GRID] Could not load saved state, starting fresh: {:#}", e);
                None
            }
        };

        let configured_base = self.config.trading.initial_base_price;
        match saved {
            Some(saved) => {
                let base = resolve_base_price(configured_base, saved.base_price);
                if base != saved.base_price {
                    info!(
                        "[GRID] Configured base price {:.4} replaces saved {:.4}",
                        base, saved.base_price
                    );
                }
                self.state.base_price = base;
                self.state.grid_size = if saved.grid_size > 0.0 {
                    saved.grid_size
                } else {
                    self.config.grid.initial_size
                };
                self.state.current_price = saved.current_price;
                self.state.volatility = saved.volatility;
                self.state.last_adjustment_time = saved.last_adjustment_time;
                self.total_profit = saved.total_profit;
                self.trade_count = saved.trade_count;
            }
            None => {
                self.state.grid_size = self.config.grid.initial_size;
                self.state.base_price = configured_base.max(0.0);
                self.state.last_adjustment_time = None;
            }
        }

        if self.state.base_price > 0.0 {
            self.state.recompute_bands();
        }
        self.profit_tx.send_replace(self.total_profit);
        self.started_at = Instant::now();
        self.is_running = true;

        info!(
            "[GRID] Initialized {} ({}): base={:.4} grid={:.2}% profit={:.4} trades={}",
            self.symbol,
            self.deps.exchange.mode(),
            self.state.base_price,
            self.state.grid_size,
            self.total_profit,
            self.trade_count
        );
        let details = format!(
            "{} grid on {} | base {:.4} | size {:.2}%",
            self.symbol,
            self.deps.exchange.name(),
            self.state.base_price,
            self.state.grid_size
        );
        if let Err(e) = self
            .deps
            .notifier
            .notify_system_status("STARTED", &details, None)
            .await
        {
            warn!("[GRID] Start notification failed: {:#}", e);
        }
        Ok(())
    }

    /// One pass of the control loop.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        let price = self
            .deps
            .exchange
            .get_ticker(&self.symbol)
            .await
            .context("Failed to fetch ticker")?;
        self.state.record_price(price);
        let volatility = self.state.update_volatility();

        if self.state.base_price <= 0.0 {
            self.state.base_price = price;
            info!("[GRID] Base price seeded from market: {:.4}", price);
        }

        if self.config.grid.dynamic_adjustment {
            self.adjust_grid_size(now).await;
        }

        self.state.recompute_bands();
        self.maintain_levels(now).await;

        if self.deps.emergency.is_active() {
            debug!("[GRID] Emergency stop active, no new grid orders");
        } else {
            self.place_grid_orders(now).await;
        }

        self.reconcile_orders(now).await;
        self.strategies.run(&self.state, now).await;
        self.maybe_save(now);

        self.deps
            .broadcaster
            .send(WSEvent::MarketUpdate(MarketEvent { price, volatility }));
        Ok(())
    }

    async fn adjust_grid_size(&mut self, now: DateTime<Utc>) {
        let grid = &self.config.grid;
        let volatility = self.state.volatility;
        let target = grid_size_for_volatility(&grid.volatility_thresholds, grid.max_size, volatility)
            .clamp(grid.min_size, grid.max_size);
        let current = self.state.grid_size;

        if !adjustment_due(current, target, volatility, self.state.last_adjustment_time, now) {
            return;
        }

        self.state.grid_size = target;
        self.state.last_adjustment_time = Some(now);
        let reason = format!(
            "Grid size {:.2}% -> {:.2}% (volatility {:.4})",
            current, target, volatility
        );
        info!("[GRID] {}", reason);
        if let Err(e) = self
            .deps
            .notifier
            .notify_strategy_signal("GRID", "ADJUSTMENT", self.state.current_price, &reason)
            .await
        {
            warn!("[GRID] Adjustment notification failed: {:#}", e);
        }
    }

    /// Rebuilds the table when the base or grid size moved it. Fills are
    /// collected and the remaining orders cancelled before the old levels go.
    async fn maintain_levels(&mut self, now: DateTime<Utc>) {
        if self.state.base_price <= 0.0
            || !self
                .levels
                .needs_rebuild(self.state.base_price, self.state.grid_size)
        {
            return;
        }

        if !self.levels.is_empty() {
            info!(
                "[GRID] Level table drifted (lowest {:?}), rebuilding",
                self.levels.lowest_price()
            );
            self.reconcile_orders(now).await;
            self.cancel_active_orders().await;
        }

        self.levels
            .build(self.state.base_price, self.state.grid_size);
        info!(
            "[GRID] Built {} levels around {:.4} at {:.2}%",
            self.levels.len(),
            self.state.base_price,
            self.state.grid_size
        );
        self.deps
            .broadcaster
            .send(WSEvent::GridLevels(self.grid_levels_view(now)));
    }

    async fn place_grid_orders(&mut self, now: DateTime<Utc>) {
        let price = self.state.current_price;
        for level in self.levels.eligible(now) {
            if !passes_guard(level.side, level.price, price) {
                continue;
            }
            let key = level.key();

            let amount = match self.order_amount(level.side, level.price).await {
                Ok(amount) => amount,
                Err(e) => {
                    warn!("[GRID] Sizing failed for level {}: {:#}", key, e);
                    self.levels.record_failure(key, now);
                    continue;
                }
            };
            if amount <= 0.0 {
                debug!("[GRID] Level {} skipped: amount below minimum", key);
                continue;
            }

            let order_price = self
                .deps
                .exchange
                .adjust_price_precision(&self.symbol, level.price);
            match self
                .deps
                .exchange
                .create_limit_order(&self.symbol, level.side, amount, order_price)
                .await
            {
                Ok(handle) => {
                    self.levels.mark_occupied(key);
                    info!(
                        "[GRID] Placed {} {:.6} @ {:.4} (level {:+})",
                        level.side, amount, order_price, level.index
                    );
                    self.broadcast_order(&handle, Some(level.index), "OPEN", 0.0);
                    self.active_orders.insert(key, handle);
                }
                Err(e) => {
                    warn!(
                        "[GRID] Order at level {:+} ({}) failed, cooling down: {:#}",
                        level.index, key, e
                    );
                    self.levels.record_failure(key, now);
                    self.deps.broadcaster.send(WSEvent::OrderUpdate(OrderEvent {
                        order_id: String::new(),
                        level_index: Some(level.index),
                        side: level.side.to_string(),
                        price: order_price,
                        amount,
                        status: "FAILED".to_string(),
                        profit: 0.0,
                    }));
                }
            }
        }
    }

    /// Base amount for a level order, or zero when the notional would fall
    /// below the minimum trade amount.
    ///
    /// Quote-funded orders spend at most a tenth of the free quote balance,
    /// capped at the minimum trade notional. Spot sells sell a tenth of the
    /// free base balance.
    async fn order_amount(&self, side: OrderSide, price: f64) -> Result<f64> {
        if price <= 0.0 {
            return Ok(0.0);
        }
        let balance = self
            .deps
            .exchange
            .get_balance()
            .await
            .context("Failed to fetch balance")?;
        let (base, quote) = split_symbol(&self.symbol);
        let min_trade = self.config.trading.min_trade_amount;

        let raw = match (self.deps.exchange.mode(), side) {
            (TradingMode::Spot, OrderSide::Sell) => balance.free(base) * ORDER_BALANCE_FRACTION,
            _ => (balance.free(quote) * ORDER_BALANCE_FRACTION).min(min_trade) / price,
        };
        let amount = self.deps.exchange.adjust_amount_precision(&self.symbol, raw);

        if amount * price < min_trade * MIN_NOTIONAL_TOLERANCE {
            return Ok(0.0);
        }
        Ok(amount)
    }

    /// Polls every active order. A failed status query only affects that
    /// order; the rest are still checked.
    async fn reconcile_orders(&mut self, now: DateTime<Utc>) {
        let keys: Vec<PriceKey> = self.active_orders.keys().copied().collect();
        for key in keys {
            let Some(handle) = self.active_orders.get(&key).cloned() else {
                continue;
            };
            let report = match self
                .deps
                .exchange
                .get_order_status(&handle.id, &self.symbol)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    if let Some(ExchangeError::OrderNotFound(_)) = e.downcast_ref::<ExchangeError>() {
                        // The exchange no longer knows the order; free the level.
                        self.active_orders.remove(&key);
                        self.levels.release(key);
                        warn!("[GRID] Order {} at {} is unknown to the exchange, releasing level", handle.id, key);
                        let index = self.levels.get(key).map(|l| l.index);
                        self.broadcast_order(&handle, index, "STALE", 0.0);
                    } else {
                        warn!("[GRID] Status check for {} failed: {:#}", handle.id, e);
                    }
                    continue;
                }
            };

            match report.status {
                OrderStatus::Open => {}
                OrderStatus::Closed => self.record_fill(key, handle, &report, now).await,
                OrderStatus::Canceled => {
                    self.active_orders.remove(&key);
                    self.levels.release(key);
                    info!("[GRID] Order {} at {} was cancelled", handle.id, key);
                    let index = self.levels.get(key).map(|l| l.index);
                    self.broadcast_order(&handle, index, "CANCELED", 0.0);
                }
            }
        }
    }

    async fn record_fill(
        &mut self,
        key: PriceKey,
        handle: OrderHandle,
        report: &OrderStatusReport,
        now: DateTime<Utc>,
    ) {
        let fill_price = if report.avg_price > 0.0 {
            report.avg_price
        } else {
            handle.price
        };
        let amount = if report.filled_amount > 0.0 {
            report.filled_amount
        } else {
            handle.amount
        };
        let profit = fill_profit(handle.side, fill_price, self.state.base_price, amount);

        self.total_profit += profit;
        self.trade_count += 1;
        self.active_orders.remove(&key);
        self.levels.release(key);
        self.profit_tx.send_replace(self.total_profit);

        info!(
            "[GRID] Filled {} {:.6} @ {:.4} profit {:.4} (total {:.4}, trades {})",
            handle.side, amount, fill_price, profit, self.total_profit, self.trade_count
        );

        let trade = TradeRecord {
            timestamp: now,
            symbol: self.symbol.clone(),
            side: handle.side,
            price: fill_price,
            amount,
            total: fill_price * amount,
            profit,
            strategy: "grid".to_string(),
            order_id: handle.id.clone(),
        };
        if let Err(e) = self.deps.store.save_trade(&trade) {
            error!("[GRID] Failed to record trade {}: {:#}", handle.id, e);
        }
        if let Err(e) = self.deps.notifier.notify_trade_execution(&trade).await {
            warn!("[GRID] Trade notification failed: {:#}", e);
        }
        let index = self.levels.get(key).map(|l| l.index);
        self.broadcast_order(&handle, index, "FILLED", profit);

        if self.deps.exchange.mode() == TradingMode::Futures {
            self.report_position().await;
        }
    }

    async fn report_position(&self) {
        let position = match self.deps.exchange.get_position(&self.symbol).await {
            Ok(position) => position,
            Err(e) => {
                warn!("[GRID] Position query failed: {:#}", e);
                return;
            }
        };
        let (side, size, pnl) = match &position {
            Some(p) => (p.side.to_string(), p.size, p.unrealized_pnl),
            None => (PositionSide::Flat.to_string(), 0.0, 0.0),
        };
        if let Err(e) = self
            .deps
            .notifier
            .notify_position_update(&self.symbol, &side, size, pnl)
            .await
        {
            warn!("[GRID] Position notification failed: {:#}", e);
        }
    }

    /// Best-effort cancel of every active order. Levels are released even
    /// when the exchange rejects the cancel.
    async fn cancel_active_orders(&mut self) -> usize {
        let orders = std::mem::take(&mut self.active_orders);
        let mut cancelled = 0;
        for (key, handle) in orders {
            match self
                .deps
                .exchange
                .cancel_order(&handle.id, &self.symbol)
                .await
            {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("[GRID] Failed to cancel {}: {:#}", handle.id, e),
            }
            self.levels.release(key);
            let index = self.levels.get(key).map(|l| l.index);
            self.broadcast_order(&handle, index, "CANCELED", 0.0);
        }
        cancelled
    }

    fn broadcast_order(&self, handle: &OrderHandle, level_index: Option<i32>, status: &str, profit: f64) {
        self.deps.broadcaster.send(WSEvent::OrderUpdate(OrderEvent {
            order_id: handle.id.clone(),
            level_index,
            side: handle.side.to_string(),
            price: handle.price,
            amount: handle.amount,
            status: status.to_string(),
            profit,
        }));
    }

    fn maybe_save(&mut self, now: DateTime<Utc>) {
        let interval = Duration::from_secs(self.config.data.save_interval);
        let due = match self.last_save {
            None => true,
            Some(at) => (now - at).to_std().unwrap_or_default() >= interval,
        };
        if due {
            if let Err(e) = self.save_state(now) {
                error!("[GRID] Failed to save state: {:#}", e);
            }
        }
    }

    pub fn save_state(&mut self, now: DateTime<Utc>) -> Result<()> {
        let snapshot = PersistedState {
            base_price: self.state.base_price,
            current_price: self.state.current_price,
            grid_size: self.state.grid_size,
            last_adjustment_time: self.state.last_adjustment_time,
            volatility: self.state.volatility,
            total_profit: self.total_profit,
            trade_count: self.trade_count,
            saved_at: Some(now),
        };
        self.deps.store.save_state(&snapshot)?;
        self.last_save = Some(now);
        Ok(())
    }

    /// Cancels open grid orders, saves state and reports the stop.
    pub async fn shutdown(&mut self) {
        info!("[GRID] Stopping: cancelling {} active orders", self.active_orders.len());
        let cancelled = self.cancel_active_orders().await;
        if let Err(e) = self.save_state(Utc::now()) {
            error!("[GRID] Failed to save final state: {:#}", e);
        }
        self.is_running = false;

        let uptime = format_uptime(self.started_at.elapsed());
        let details = format!(
            "{} stopped | {} orders cancelled | profit {:.4} over {} trades",
            self.symbol, cancelled, self.total_profit, self.trade_count
        );
        if let Err(e) = self
            .deps
            .notifier
            .notify_system_status("STOPPED", &details, Some(&uptime))
            .await
        {
            warn!("[GRID] Stop notification failed: {:#}", e);
        }
        self.deps.broadcaster.send(WSEvent::Status(self.status()));
        info!("[GRID] Stopped after {}", uptime);
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            is_running: self.is_running,
            symbol: self.symbol.clone(),
            base_price: self.state.base_price,
            current_price: self.state.current_price,
            grid_size: self.state.grid_size,
            upper_band: self.state.upper_band,
            lower_band: self.state.lower_band,
            volatility: self.state.volatility,
            total_profit: self.total_profit,
            trade_count: self.trade_count,
            uptime: format_uptime(self.started_at.elapsed()),
            active_orders: self
                .active_orders
                .iter()
                .map(|(key, handle)| (key.to_string(), handle.id.clone()))
                .collect(),
            grid_levels_occupied: self.levels.occupied_count(),
            emergency_stop: self.deps.emergency.is_active(),
            alert_count: self.deps.alerts.len(),
        }
    }

    pub fn grid_levels_view(&self, now: DateTime<Utc>) -> GridLevelsView {
        let current = self.state.current_price;
        GridLevelsView {
            symbol: self.symbol.clone(),
            current_price: current,
            base_price: self.state.base_price,
            levels: self
                .levels
                .iter()
                .map(|level| LevelInfo {
                    index: level.index,
                    price: level.price,
                    side: level.side.to_string(),
                    occupied: level.occupied,
                    cooling_down: self.levels.is_cooling_down(level, now),
                    distance_pct: if current > 0.0 {
                        (level.price - current) / current * 100.0
                    } else {
                        0.0
                    },
                })
                .collect(),
        }
    }

    pub fn trade_history(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.deps.store.trade_history(limit)
    }

    /// Runs until Ctrl-C. A failed tick is logged and retried after the
    /// back-off interval; it never ends the loop.
    pub async fn run(mut self) -> Result<()> {
        self.initialize(Utc::now()).await?;

        let position_interval = Duration::from_secs(self.config.engine.position_update_interval);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(PortfolioSnapshot::default()));
        let accountant = PortfolioAccountant::new(
            self.deps.exchange.clone(),
            &self.symbol,
            self.profit_feed(),
        );
        let accountant_task = tokio::spawn(accountant.run(position_interval, snapshot_tx));

        let evaluator = RiskEvaluator::new(
            self.config.risk.clone(),
            &self.symbol,
            self.deps.exchange.clone(),
            self.deps.notifier.clone(),
            self.deps.emergency.clone(),
            self.deps.alerts.clone(),
        )
        .with_broadcaster(self.deps.broadcaster.clone());
        let risk_task = tokio::spawn(evaluator.run(
            Duration::from_secs(self.config.risk.risk_check_interval),
            snapshot_rx,
            position_interval * 3,
        ));

        let tick_interval = Duration::from_secs(self.config.engine.tick_interval_secs);
        let error_backoff = Duration::from_secs(self.config.engine.error_backoff_secs);
        let next_tick = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(next_tick);
        let mut status_timer = tokio::time::interval(STATUS_BROADCAST_INTERVAL);

        info!("[GRID] Starting control loop ({}s tick)", tick_interval.as_secs());
        loop {
            tokio::select! {
                _ = &mut next_tick => {
                    let delay = match self.tick_at(Utc::now()).await {
                        Ok(()) => tick_interval,
                        Err(e) => {
                            error!("[GRID] Tick failed, backing off {}s: {:#}", error_backoff.as_secs(), e);
                            if let Err(notify_err) = self
                                .deps
                                .notifier
                                .notify_error("TICK_FAILED", &format!("{:#}", e), Some(&self.symbol))
                                .await
                            {
                                warn!("[GRID] Error notification failed: {:#}", notify_err);
                            }
                            error_backoff
                        }
                    };
                    next_tick.as_mut().reset(tokio::time::Instant::now() + delay);
                }
                _ = status_timer.tick() => {
                    self.deps.broadcaster.send(WSEvent::Status(self.status()));
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Stopping Engine...");
                    break;
                }
            }
        }

        accountant_task.abort();
        risk_task.abort();
        self.shutdown().await;
        info!("Engine stopped gracefully.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::simulation::{BalanceMode, SimulationConfig};
    use crate::exchange::paper::PaperExchange;
    use crate::model::{BalanceSnapshot, Candle, NotificationLevel, PositionSnapshot};
    use crate::persistence::JsonStateStore;
    use crate::reporter::testing::RecordingNotifier;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Paper exchange whose limit orders can be switched to fail and which
    /// can forget every order it was asked about.
    struct RejectingExchange {
        inner: Arc<PaperExchange>,
        reject: AtomicBool,
        forget_orders: AtomicBool,
    }

    impl RejectingExchange {
        fn wrap(inner: Arc<PaperExchange>, reject: bool) -> Self {
            Self {
                inner,
                reject: AtomicBool::new(reject),
                forget_orders: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Exchange for RejectingExchange {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn mode(&self) -> TradingMode {
            self.inner.mode()
        }

        async fn get_ticker(&self, symbol: &str) -> Result<f64> {
            self.inner.get_ticker(symbol).await
        }

        async fn create_limit_order(
            &self,
            symbol: &str,
            side: OrderSide,
            amount: f64,
            price: f64,
        ) -> Result<OrderHandle> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("order rejected"));
            }
            self.inner.create_limit_order(symbol, side, amount, price).await
        }

        async fn create_market_order(&self, symbol: &str, side: OrderSide, amount: f64) -> Result<OrderHandle> {
            self.inner.create_market_order(symbol, side, amount).await
        }

        async fn cancel_order(&self, id: &str, symbol: &str) -> Result<()> {
            self.inner.cancel_order(id, symbol).await
        }

        async fn get_order_status(&self, id: &str, symbol: &str) -> Result<OrderStatusReport> {
            if self.forget_orders.load(Ordering::SeqCst) {
                return Err(ExchangeError::OrderNotFound(id.to_string()).into());
            }
            self.inner.get_order_status(id, symbol).await
        }

        async fn get_balance(&self) -> Result<BalanceSnapshot> {
            self.inner.get_balance().await
        }

        async fn get_position(&self, symbol: &str) -> Result<Option<PositionSnapshot>> {
            self.inner.get_position(symbol).await
        }

        async fn get_klines(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
            self.inner.get_klines(symbol, limit).await
        }

        async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize> {
            self.inner.cancel_all_orders(symbol).await
        }

        async fn get_account_value(&self) -> Result<f64> {
            self.inner.get_account_value().await
        }

        fn adjust_amount_precision(&self, symbol: &str, amount: f64) -> f64 {
            self.inner.adjust_amount_precision(symbol, amount)
        }

        fn adjust_price_precision(&self, symbol: &str, price: f64) -> f64 {
            self.inner.adjust_price_precision(symbol, price)
        }
    }

    struct Harness {
        engine: GridEngine,
        exchange: Arc<PaperExchange>,
        notifier: Arc<RecordingNotifier>,
        store: Arc<JsonStateStore>,
    }

    fn btc_config(base: f64, dir: &Path) -> BotConfig {
        let mut config = BotConfig::default();
        config.trading.symbol = "BTC/USDT".to_string();
        config.trading.initial_base_price = base;
        config.trading.min_trade_amount = 100.0;
        config.grid.dynamic_adjustment = false;
        config.strategies.breakout.enabled = false;
        config.data.state_file = dir.join("state.json").to_string_lossy().into_owned();
        config.data.trades_file = dir.join("trades.csv").to_string_lossy().into_owned();
        config
    }

    fn paper(config: &BotConfig, balances: &[(&str, f64)], price: f64) -> Arc<PaperExchange> {
        let sim = SimulationConfig {
            balance_mode: BalanceMode::Override,
            balance_overrides: balances.iter().map(|(a, v)| (a.to_string(), *v)).collect(),
            initial_price: price,
            random_walk_step_pct: 0.0,
            ..SimulationConfig::default()
        };
        Arc::new(PaperExchange::new(
            config.symbol(),
            config.trading.mode,
            config.trading.leverage,
            &sim,
        ))
    }

    fn engine_on(config: BotConfig, exchange: Arc<dyn Exchange>) -> (GridEngine, Arc<RecordingNotifier>, Arc<JsonStateStore>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(JsonStateStore::new(&config.data).unwrap());
        let deps = EngineDeps {
            exchange,
            notifier: notifier.clone(),
            store: store.clone(),
            broadcaster: StatusBroadcaster::new(None),
            emergency: EmergencyStop::new(Some("secret".to_string())),
            alerts: AlertHistory::default(),
        };
        (GridEngine::new(config, deps).unwrap(), notifier, store)
    }

    fn harness(config: BotConfig, balances: &[(&str, f64)], price: f64) -> Harness {
        let exchange = paper(&config, balances, price);
        let (engine, notifier, store) = engine_on(config, exchange.clone());
        Harness {
            engine,
            exchange,
            notifier,
            store,
        }
    }

    #[test]
    fn test_guard_scenario() {
        // base 100000, grid 2%, current 100500
        assert!(passes_guard(OrderSide::Buy, 98_000.0, 100_500.0));
        assert!(passes_guard(OrderSide::Sell, 102_000.0, 100_500.0));
        // Within 0.1% of the market is rejected on both sides.
        assert!(!passes_guard(OrderSide::Buy, 100_450.0, 100_500.0));
        assert!(!passes_guard(OrderSide::Sell, 100_550.0, 100_500.0));
    }

    #[test]
    fn test_fill_profit_scenario() {
        assert!((fill_profit(OrderSide::Sell, 101_000.0, 100_000.0, 0.01) - 10.0).abs() < 1e-9);
        assert_eq!(fill_profit(OrderSide::Buy, 99_000.0, 100_000.0, 0.01), 0.0);
    }

    #[tokio::test]
    async fn test_tick_places_guarded_orders_on_both_sides() {
        let dir = tempdir().unwrap();
        let mut h = harness(
            btc_config(100_000.0, dir.path()),
            &[("USDT", 50_000.0), ("BTC", 1.0)],
            100_500.0,
        );
        h.engine.initialize(Utc::now()).await.unwrap();
        h.engine.tick_at(Utc::now()).await.unwrap();

        let status = h.engine.status();
        assert_eq!(status.base_price, 100_000.0);
        assert!((status.lower_band - 98_000.0).abs() < 1e-6);
        assert!((status.upper_band - 102_000.0).abs() < 1e-6);
        assert_eq!(h.engine.levels().len(), 10);
        // All five buys sit below 100399.5 and all five sells above 100600.5.
        assert_eq!(status.grid_levels_occupied, 10);
        assert_eq!(h.exchange.open_order_count(), 10);
        assert!(status.active_orders.contains_key("98000.0000"));
        assert!(status.active_orders.contains_key("102000.0000"));
    }

    #[tokio::test]
    async fn test_buy_size_capped_at_min_trade() {
        let dir = tempdir().unwrap();
        let mut h = harness(btc_config(100_000.0, dir.path()), &[("USDT", 50_000.0)], 100_500.0);
        h.engine.initialize(Utc::now()).await.unwrap();
        let amount = h.engine.order_amount(OrderSide::Buy, 98_000.0).await.unwrap();
        // min(5000, 100) / 98000 at 6 decimals
        assert!((amount - 0.00102).abs() < 1e-9);
        // No base balance: sells resolve to zero instead of failing.
        assert_eq!(h.engine.order_amount(OrderSide::Sell, 102_000.0).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_small_balance_skips_without_cooldown() {
        let dir = tempdir().unwrap();
        let mut h = harness(btc_config(100_000.0, dir.path()), &[("USDT", 500.0)], 100_500.0);
        h.engine.initialize(Utc::now()).await.unwrap();
        h.engine.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.exchange.open_order_count(), 0);
        assert!(h.engine.levels().iter().all(|l| l.last_attempt.is_none()));
    }

    #[tokio::test]
    async fn test_sell_fill_records_profit_and_frees_level() {
        let dir = tempdir().unwrap();
        let mut h = harness(
            btc_config(100_000.0, dir.path()),
            &[("USDT", 50_000.0), ("BTC", 1.0)],
            100_500.0,
        );
        let start = Utc::now();
        h.engine.initialize(start).await.unwrap();
        h.engine.tick_at(start).await.unwrap();

        // Level +1 holds the first sell (0.1 BTC) and fills once the market
        // trades through 102000.
        h.exchange.set_price("BTC/USDT", 102_500.0).unwrap();
        h.engine.tick_at(start + ChronoDuration::seconds(5)).await.unwrap();

        assert_eq!(h.engine.trade_count(), 1);
        let expected = (102_000.0 - 100_000.0) * 0.1;
        assert!((h.engine.total_profit() - expected).abs() < 1e-6);
        assert_eq!(*h.engine.profit_feed().borrow(), h.engine.total_profit());
        assert_eq!(h.notifier.count(NotificationLevel::Trade), 1);

        let level = h.engine.levels().get(PriceKey::from_price(102_000.0)).unwrap();
        assert!(!level.occupied);
        assert!(!h.engine.status().active_orders.contains_key("102000.0000"));

        let trades = h.engine.trade_history(10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, OrderSide::Sell);
        assert!((trades[0].profit - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_external_cancel_releases_level_without_profit() {
        let dir = tempdir().unwrap();
        let mut h = harness(btc_config(100_000.0, dir.path()), &[("USDT", 50_000.0)], 100_500.0);
        let now = Utc::now();
        h.engine.initialize(now).await.unwrap();
        h.engine.tick_at(now).await.unwrap();
        assert_eq!(h.engine.levels().occupied_count(), 5);

        h.exchange.cancel_all_orders(None).await.unwrap();
        h.engine.reconcile_orders(now).await;
        assert_eq!(h.engine.levels().occupied_count(), 0);
        assert_eq!(h.engine.trade_count(), 0);
        assert_eq!(h.engine.total_profit(), 0.0);
    }

    #[tokio::test]
    async fn test_rejected_order_cools_level_down() {
        let dir = tempdir().unwrap();
        let config = btc_config(100_000.0, dir.path());
        let inner = paper(&config, &[("USDT", 50_000.0)], 100_500.0);
        let exchange = Arc::new(RejectingExchange::wrap(inner.clone(), true));
        let (mut engine, _, _) = engine_on(config, exchange.clone());

        let now = Utc::now();
        engine.initialize(now).await.unwrap();
        engine.tick_at(now).await.unwrap();
        let key = PriceKey::from_price(98_000.0);
        assert!(!engine.levels().get(key).unwrap().occupied);
        assert_eq!(engine.levels().get(key).unwrap().last_attempt, Some(now));

        // Still inside the cooldown: no retry even though orders would pass.
        exchange.reject.store(false, Ordering::SeqCst);
        engine.tick_at(now + ChronoDuration::seconds(10)).await.unwrap();
        assert_eq!(inner.open_order_count(), 0);

        engine.tick_at(now + ChronoDuration::seconds(301)).await.unwrap();
        assert!(engine.levels().get(key).unwrap().occupied);
        assert_eq!(inner.open_order_count(), 5);
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_new_orders_but_reconciles() {
        let dir = tempdir().unwrap();
        let mut h = harness(
            btc_config(100_000.0, dir.path()),
            &[("USDT", 50_000.0), ("BTC", 1.0)],
            100_500.0,
        );
        let now = Utc::now();
        h.engine.initialize(now).await.unwrap();
        h.engine.emergency().trigger("test");
        h.engine.tick_at(now).await.unwrap();
        assert_eq!(h.exchange.open_order_count(), 0);

        h.engine.emergency().reset("secret").unwrap();
        h.engine.tick_at(now).await.unwrap();
        assert_eq!(h.exchange.open_order_count(), 10);

        h.engine.emergency().trigger("test");
        h.exchange.set_price("BTC/USDT", 102_500.0).unwrap();
        h.engine.tick_at(now).await.unwrap();
        assert_eq!(h.engine.trade_count(), 1);
        assert!(h.engine.status().emergency_stop);
    }

    #[tokio::test]
    async fn test_base_price_seeded_from_first_tick() {
        let dir = tempdir().unwrap();
        let mut h = harness(btc_config(0.0, dir.path()), &[("USDT", 1_000.0)], 64_000.0);
        h.engine.initialize(Utc::now()).await.unwrap();
        assert_eq!(h.engine.state().base_price, 0.0);
        h.engine.tick_at(Utc::now()).await.unwrap();
        assert_eq!(h.engine.state().base_price, 64_000.0);
        assert_eq!(h.engine.levels().len(), 10);
    }

    #[tokio::test]
    async fn test_dynamic_adjustment_notifies_and_rebuilds() {
        let dir = tempdir().unwrap();
        let mut config = btc_config(300.0, dir.path());
        config.trading.symbol = "BNB/USDT".to_string();
        config.trading.min_trade_amount = 1.0;
        config.grid.dynamic_adjustment = true;
        let mut h = harness(config, &[("USDT", 1_000.0)], 300.0);

        // A fresh start adjusts on the first tick: flat prices give 1.0%.
        let start = Utc::now();
        h.engine.initialize(start).await.unwrap();
        assert_eq!(h.engine.state().last_adjustment_time, None);
        h.engine.tick_at(start).await.unwrap();
        assert_eq!(h.engine.state().grid_size, 1.0);
        assert_eq!(h.engine.state().last_adjustment_time, Some(start));
        assert_eq!(h.engine.levels().lowest_price(), Some(285.0));
        assert_eq!(h.notifier.count(NotificationLevel::Trade), 1);
        assert!(h.notifier.contains("ADJUSTMENT"));
        assert!(h.exchange.open_order_count() > 0);

        // Inside the interval a wider grid is left alone, only rebuilt.
        h.engine.state.grid_size = 2.0;
        h.engine.tick_at(start + ChronoDuration::minutes(10)).await.unwrap();
        assert_eq!(h.engine.state().grid_size, 2.0);
        assert_eq!(h.engine.levels().lowest_price(), Some(270.0));
        assert_eq!(h.notifier.count(NotificationLevel::Trade), 1);

        let later = start + ChronoDuration::minutes(61);
        h.engine.tick_at(later).await.unwrap();
        assert_eq!(h.engine.state().grid_size, 1.0);
        assert_eq!(h.notifier.count(NotificationLevel::Trade), 2);
        assert_eq!(h.engine.levels().lowest_price(), Some(285.0));
        // Old orders were cancelled before the rebuild.
        assert_eq!(h.exchange.open_order_count(), h.engine.levels().occupied_count());
    }

    #[tokio::test]
    async fn test_restart_restores_persisted_state() {
        let dir = tempdir().unwrap();
        let mut h = harness(
            btc_config(100_000.0, dir.path()),
            &[("USDT", 50_000.0), ("BTC", 1.0)],
            100_500.0,
        );
        let now = Utc::now();
        h.engine.initialize(now).await.unwrap();
        h.engine.tick_at(now).await.unwrap();
        h.exchange.set_price("BTC/USDT", 102_500.0).unwrap();
        h.engine.tick_at(now).await.unwrap();
        h.engine.shutdown().await;
        assert_eq!(h.exchange.open_order_count(), 0);
        assert!(h.notifier.contains("STOPPED"));

        let saved = h.store.load_state().unwrap().unwrap();
        assert_eq!(saved.trade_count, 1);

        // Configured base within noise of the saved one: saved state wins.
        let mut restarted = harness(
            btc_config(100_000.5, dir.path()),
            &[("USDT", 50_000.0)],
            100_500.0,
        );
        restarted.engine.initialize(now).await.unwrap();
        assert_eq!(restarted.engine.state().base_price, saved.base_price);
        assert_eq!(restarted.engine.state().grid_size, saved.grid_size);
        assert_eq!(restarted.engine.total_profit(), saved.total_profit);
        assert_eq!(restarted.engine.trade_count(), saved.trade_count);

        // A configured base far from the saved one replaces it.
        let mut moved = harness(btc_config(90_000.0, dir.path()), &[("USDT", 50_000.0)], 90_000.0);
        moved.engine.initialize(now).await.unwrap();
        assert_eq!(moved.engine.state().base_price, 90_000.0);
        assert_eq!(moved.engine.trade_count(), 1);
    }

    #[tokio::test]
    async fn test_grid_levels_view_marks_cooldown() {
        let dir = tempdir().unwrap();
        let mut h = harness(btc_config(100_000.0, dir.path()), &[("USDT", 0.0)], 100_500.0);
        let now = Utc::now();
        h.engine.initialize(now).await.unwrap();
        h.engine.tick_at(now).await.unwrap();
        h.engine.levels.record_failure(PriceKey::from_price(98_000.0), now);

        let view = h.engine.grid_levels_view(now);
        assert_eq!(view.levels.len(), 10);
        let level = view.levels.iter().find(|l| l.index == -1).unwrap();
        assert!(level.cooling_down);
        assert_eq!(level.side, "buy");
        assert!(level.distance_pct < 0.0);
    }

    #[tokio::test]
    async fn test_futures_fill_reports_position() {
        let dir = tempdir().unwrap();
        let mut config = btc_config(100_000.0, dir.path());
        config.trading.mode = TradingMode::Futures;
        config.trading.leverage = 5;
        let mut h = harness(config, &[("USDT", 50_000.0)], 100_500.0);
        let now = Utc::now();
        h.engine.initialize(now).await.unwrap();
        h.engine.tick_at(now).await.unwrap();
        // Futures sizing uses quote on both sides.
        assert_eq!(h.exchange.open_order_count(), 10);

        h.exchange.set_price("BTC/USDT", 97_500.0).unwrap();
        h.engine.tick_at(now).await.unwrap();
        assert_eq!(h.engine.trade_count(), 1);
        // Buy fills realize nothing.
        assert_eq!(h.engine.total_profit(), 0.0);
        assert!(h.notifier.contains("Position Update"));
        assert!(h.notifier.contains("long"));
    }

    #[tokio::test]
    async fn test_orders_unknown_to_exchange_release_levels() {
        let dir = tempdir().unwrap();
        let config = btc_config(100_000.0, dir.path());
        let inner = paper(&config, &[("USDT", 50_000.0), ("BTC", 1.0)], 100_500.0);
        let exchange = Arc::new(RejectingExchange::wrap(inner.clone(), false));
        let (mut engine, _, _) = engine_on(config, exchange.clone());

        let now = Utc::now();
        engine.initialize(now).await.unwrap();
        engine.tick_at(now).await.unwrap();
        assert_eq!(engine.status().grid_levels_occupied, 10);

        // The exchange pruned its history: every status query now fails.
        exchange.forget_orders.store(true, Ordering::SeqCst);
        exchange.reject.store(true, Ordering::SeqCst);
        engine.tick_at(now + ChronoDuration::seconds(5)).await.unwrap();

        let status = engine.status();
        assert_eq!(status.grid_levels_occupied, 0);
        assert!(status.active_orders.is_empty());
        assert_eq!(engine.trade_count(), 0);

        // Freed levels are placed again on the next tick.
        exchange.forget_orders.store(false, Ordering::SeqCst);
        exchange.reject.store(false, Ordering::SeqCst);
        inner.cancel_all_orders(None).await.unwrap();
        engine.tick_at(now + ChronoDuration::seconds(10)).await.unwrap();
        assert_eq!(engine.status().grid_levels_occupied, 10);
    }

    #[tokio::test]
    async fn test_transient_status_errors_keep_levels() {
        let dir = tempdir().unwrap();
        let config = btc_config(100_000.0, dir.path());
        let inner = paper(&config, &[("USDT", 50_000.0)], 100_500.0);
        let exchange = Arc::new(RejectingExchange::wrap(inner.clone(), false));
        let (mut engine, _, _) = engine_on(config, exchange);

        let now = Utc::now();
        engine.initialize(now).await.unwrap();
        engine.tick_at(now).await.unwrap();
        assert_eq!(engine.levels().occupied_count(), 5);

        // A wrong symbol makes the paper exchange fail with UnknownSymbol.
        engine.symbol = "ETH/USDT".to_string();
        engine.reconcile_orders(now).await;
        assert_eq!(engine.levels().occupied_count(), 5);
    }
}

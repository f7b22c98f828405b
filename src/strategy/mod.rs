pub mod breakout;
pub mod common;
pub mod types;

use crate::config::strategy::StrategiesConfig;
use crate::engine::state::GridState;
use crate::exchange::Exchange;
use crate::model::OrderHandle;
use crate::reporter::Notifier;
use crate::risk::EmergencyStop;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use types::StrategySignal;

pub const AVAILABLE_STRATEGIES: &[&str] = &["breakout"];

/// A secondary strategy evaluated against the grid's market snapshot.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// A disabled strategy returns a hold signal without doing any work.
    async fn evaluate(&mut self, state: &GridState, now: DateTime<Utc>) -> Result<StrategySignal>;

    /// Acts on a signal. `Ok(None)` when the strategy only reports signals.
    async fn execute_adjustment(&mut self, signal: &StrategySignal) -> Result<Option<OrderHandle>>;
}

pub fn init_strategy(
    name: &str,
    config: &StrategiesConfig,
    symbol: &str,
    exchange: Arc<dyn Exchange>,
) -> Result<Box<dyn Strategy>> {
    match name {
        "breakout" => {
            config.breakout.validate()?;
            Ok(Box::new(breakout::BreakoutStrategy::new(
                config.breakout.clone(),
                symbol,
                exchange,
            )))
        }
        other => Err(anyhow!(
            "Unknown strategy '{}'. Available: {}",
            other,
            AVAILABLE_STRATEGIES.join(", ")
        )),
    }
}

/// Runs every registered strategy once per controller tick.
pub struct StrategyManager {
    slots: Vec<Box<dyn Strategy>>,
    notifier: Arc<dyn Notifier>,
    emergency: EmergencyStop,
}

impl StrategyManager {
    pub fn new(notifier: Arc<dyn Notifier>, emergency: EmergencyStop) -> Self {
        Self {
            slots: Vec::new(),
            notifier,
            emergency,
        }
    }

    /// Registers every built-in strategy from `config`.
    pub fn from_config(
        config: &StrategiesConfig,
        symbol: &str,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        emergency: EmergencyStop,
    ) -> Result<Self> {
        let mut manager = Self::new(notifier, emergency);
        for name in AVAILABLE_STRATEGIES {
            manager.register(init_strategy(name, config, symbol, exchange.clone())?);
        }
        Ok(manager)
    }

    pub fn register(&mut self, strategy: Box<dyn Strategy>) {
        info!(
            "[STRATEGY] Registered {} ({})",
            strategy.name(),
            if strategy.is_enabled() { "enabled" } else { "disabled" }
        );
        self.slots.push(strategy);
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.slots.iter_mut().find(|s| s.name() == name) {
            Some(slot) => {
                slot.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Evaluates each slot and acts on its signal. Failures are logged per
    /// slot; the remaining slots still run.
    pub async fn run(&mut self, state: &GridState, now: DateTime<Utc>) -> Vec<StrategySignal> {
        let mut issued = Vec::new();
        for slot in self.slots.iter_mut() {
            let signal = match slot.evaluate(state, now).await {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("[STRATEGY] {} evaluation failed: {:#}", slot.name(), e);
                    continue;
                }
            };
            if !signal.is_actionable() {
                continue;
            }

            info!(
                "[STRATEGY] {} signal {}: {}",
                slot.name(),
                signal.action,
                signal.reason
            );
            if let Err(e) = self
                .notifier
                .notify_strategy_signal(
                    slot.name(),
                    &signal.action.to_string(),
                    signal.price,
                    &signal.reason,
                )
                .await
            {
                warn!("[STRATEGY] Signal notification failed: {:#}", e);
            }

            if self.emergency.is_active() {
                warn!("[STRATEGY] Emergency stop active, {} adjustment skipped", slot.name());
            } else if let Err(e) = slot.execute_adjustment(&signal).await {
                error!("[STRATEGY] {} adjustment failed: {:#}", slot.name(), e);
            }
            issued.push(signal);
        }
        issued
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

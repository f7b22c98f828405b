//! Notification collaborator.
//!
//! Notifications are fire-and-forget: every method returns a `Result` so the
//! caller can log a failed delivery, but nothing in the control loop waits on
//! or branches on delivery.

pub mod telegram;

use crate::broadcast::types::WSEvent;
use crate::config::broadcast::{NotificationConfig, TelegramConfig};
use crate::constants::NOTIFICATION_RATE_WINDOW;
use crate::model::{NotificationLevel, TradeRecord};
use crate::risk::EmergencyStop;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one formatted message. HTML bold/code tags are allowed.
    async fn send_message(&self, level: NotificationLevel, text: &str) -> Result<()>;

    async fn notify_trade_execution(&self, trade: &TradeRecord) -> Result<()> {
        let icon = if trade.side.is_buy() { "🟢" } else { "🔴" };
        let text = format!(
            "{} <b>Trade Executed</b> [{}]\nSymbol: <code>{}</code>\nSide: {}\nPrice: <code>{:.4}</code>\nAmount: <code>{:.6}</code>\nTotal: <code>{:.2}</code>\nProfit: <code>{:.4}</code>",
            icon,
            trade.strategy,
            trade.symbol,
            trade.side,
            trade.price,
            trade.amount,
            trade.total,
            trade.profit
        );
        self.send_message(NotificationLevel::Trade, &text).await
    }

    async fn notify_risk_alert(
        &self,
        alert_type: &str,
        current_value: f64,
        threshold: f64,
        action: &str,
    ) -> Result<()> {
        let text = format!(
            "⚠️ <b>Risk Alert</b>\nType: <code>{}</code>\nCurrent: <code>{:.4}</code>\nThreshold: <code>{:.4}</code>\nAction: {}",
            alert_type, current_value, threshold, action
        );
        self.send_message(NotificationLevel::Risk, &text).await
    }

    async fn notify_system_status(
        &self,
        status: &str,
        details: &str,
        uptime: Option<&str>,
    ) -> Result<()> {
        let mut text = format!("ℹ️ <b>System {}</b>\n{}", status, details);
        if let Some(uptime) = uptime {
            text.push_str(&format!("\nUptime: {}", uptime));
        }
        self.send_message(NotificationLevel::System, &text).await
    }

    async fn notify_error(
        &self,
        error_type: &str,
        message: &str,
        context: Option<&str>,
    ) -> Result<()> {
        let mut text = format!(
            "❌ <b>Error: {}</b>\n{}\nTime: {}",
            error_type,
            message,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Some(context) = context {
            text.push_str(&format!("\nContext: {}", context));
        }
        self.send_message(NotificationLevel::Error, &text).await
    }

    async fn notify_strategy_signal(
        &self,
        strategy: &str,
        signal: &str,
        price: f64,
        reason: &str,
    ) -> Result<()> {
        let text = format!(
            "📈 <b>{} Signal: {}</b>\nPrice: <code>{:.4}</code>\nReason: {}",
            strategy, signal, price, reason
        );
        self.send_message(NotificationLevel::Trade, &text).await
    }

    async fn notify_position_update(
        &self,
        symbol: &str,
        side: &str,
        size: f64,
        unrealized_pnl: f64,
    ) -> Result<()> {
        let text = format!(
            "📦 <b>Position Update</b>\nSymbol: <code>{}</code>\nSide: {}\nSize: <code>{:.6}</code>\nUnrealized PnL: <code>{:.4}</code>",
            symbol, side, size, unrealized_pnl
        );
        self.send_message(NotificationLevel::Trade, &text).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Deliver,
    LevelDisabled,
    RateLimited,
}

/// Level filter plus sliding-window rate limiter shared by notifier backends.
pub struct NotificationGate {
    levels: HashSet<NotificationLevel>,
    limit: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl NotificationGate {
    pub fn new(config: &NotificationConfig) -> Self {
        Self::with_window(config, NOTIFICATION_RATE_WINDOW)
    }

    pub fn with_window(config: &NotificationConfig, window: Duration) -> Self {
        Self {
            levels: config.levels.iter().copied().collect(),
            limit: config.rate_limit_per_minute,
            window,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn level_enabled(&self, level: NotificationLevel) -> bool {
        self.levels.contains(&level)
    }

    pub fn admit(&self, level: NotificationLevel, now: Instant) -> Admission {
        if !self.level_enabled(level) {
            return Admission::LevelDisabled;
        }
        let Ok(mut sent) = self.sent.lock() else {
            return Admission::Deliver;
        };
        while let Some(oldest) = sent.front() {
            if now.duration_since(*oldest) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() >= self.limit {
            return Admission::RateLimited;
        }
        sent.push_back(now);
        Admission::Deliver
    }
}

/// Writes notifications to the tracing log only.
pub struct LogNotifier {
    gate: NotificationGate,
}

impl LogNotifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            gate: NotificationGate::new(config),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, level: NotificationLevel, text: &str) -> Result<()> {
        match self.gate.admit(level, Instant::now()) {
            Admission::Deliver => {}
            Admission::LevelDisabled => return Ok(()),
            Admission::RateLimited => {
                tracing::warn!("[NOTIFY] Rate limit reached, dropping {} notification", level);
                return Ok(());
            }
        }
        let plain = strip_tags(text).replace('\n', " | ");
        match level {
            NotificationLevel::Error => tracing::error!("[NOTIFY] {}", plain),
            NotificationLevel::Risk => tracing::warn!("[NOTIFY] {}", plain),
            _ => tracing::info!("[NOTIFY] {}", plain),
        }
        Ok(())
    }
}

/// Removes `<...>` markup for plain-text sinks.
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Builds the notifier named by `config.channel`.
///
/// Returns the background worker handle when the backend has one, so the
/// caller can let it drain on shutdown.
pub fn init_notifier(
    config: &NotificationConfig,
    telegram: Option<TelegramConfig>,
    status_rx: broadcast::Receiver<WSEvent>,
    emergency: EmergencyStop,
) -> Result<(Arc<dyn Notifier>, Option<JoinHandle<()>>)> {
    let use_telegram = match config.channel.as_str() {
        "log" => false,
        "telegram" => true,
        "auto" => telegram.is_some(),
        other => return Err(anyhow!("Unknown notification channel '{}'", other)),
    };

    if !use_telegram {
        return Ok((Arc::new(LogNotifier::new(config)), None));
    }

    let telegram = telegram.ok_or_else(|| {
        anyhow!("Telegram notifications need TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID")
    })?;
    let (notifier, worker) =
        telegram::TelegramNotifier::spawn(telegram, NotificationGate::new(config), status_rx, emergency)?;
    Ok((Arc::new(notifier), Some(worker)))
}

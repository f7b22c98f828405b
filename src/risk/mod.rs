//! Risk evaluation and the emergency stop.
//!
//! [`evaluate`] is a pure function from a portfolio snapshot to alerts. The
//! [`RiskEvaluator`] wraps it with the side effects: alert history, logging,
//! notification, and triggering the emergency stop when an extreme condition
//! is reached.

pub mod emergency;

pub use emergency::EmergencyStop;

use crate::broadcast::{StatusBroadcaster, WSEvent};
use crate::config::risk::RiskConfig;
use crate::constants::{
    ALERT_HISTORY_CAP, CRITICAL_BREACH_MULTIPLIER, EMERGENCY_BREACH_MULTIPLIER,
    EMERGENCY_POSITION_RATIO,
};
use crate::exchange::Exchange;
use crate::portfolio::PortfolioSnapshot;
use crate::reporter::Notifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    PositionLimitExceeded,
    PositionBelowMinimum,
    MaxDrawdownExceeded,
    DailyLossLimitExceeded,
    ExtremeDrawdown,
    ExtremeDailyLoss,
    ExtremePositionRatio,
    SystemError,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PositionLimitExceeded => "POSITION_LIMIT_EXCEEDED",
            AlertKind::PositionBelowMinimum => "POSITION_BELOW_MINIMUM",
            AlertKind::MaxDrawdownExceeded => "MAX_DRAWDOWN_EXCEEDED",
            AlertKind::DailyLossLimitExceeded => "DAILY_LOSS_LIMIT_EXCEEDED",
            AlertKind::ExtremeDrawdown => "EXTREME_DRAWDOWN",
            AlertKind::ExtremeDailyLoss => "EXTREME_DAILY_LOSS",
            AlertKind::ExtremePositionRatio => "EXTREME_POSITION_RATIO",
            AlertKind::SystemError => "SYSTEM_ERROR",
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            AlertKind::ExtremeDrawdown | AlertKind::ExtremeDailyLoss | AlertKind::ExtremePositionRatio
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    /// Operator attention wanted. Only emergency kinds halt trading.
    pub action_required: bool,
}

impl RiskAlert {
    fn new(
        kind: AlertKind,
        severity: Severity,
        message: String,
        current_value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            severity,
            message,
            current_value,
            threshold,
            timestamp: now,
            action_required: kind != AlertKind::PositionBelowMinimum,
        }
    }
}

/// Bounded alert log shared between the evaluator and status readers.
#[derive(Clone, Default)]
pub struct AlertHistory {
    alerts: Arc<Mutex<VecDeque<RiskAlert>>>,
}

impl AlertHistory {
    pub fn push(&self, alert: RiskAlert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            if alerts.len() >= ALERT_HISTORY_CAP {
                alerts.pop_front();
            }
            alerts.push_back(alert);
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest `limit` alerts, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<RiskAlert> {
        self.alerts
            .lock()
            .map(|a| {
                let skip = a.len().saturating_sub(limit);
                a.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

/// Severity for a loss-style breach: critical once the value reaches 1.5x the limit.
fn breach_severity(value: f64, limit: f64) -> Severity {
    if value <= limit * CRITICAL_BREACH_MULTIPLIER {
        Severity::Critical
    } else {
        Severity::High
    }
}

/// Applies every threshold rule to one snapshot.
pub fn evaluate(config: &RiskConfig, snapshot: &PortfolioSnapshot, now: DateTime<Utc>) -> Vec<RiskAlert> {
    let mut alerts = Vec::new();
    let ratio = snapshot.metrics.position_ratio;
    let drawdown = snapshot.current_drawdown;
    let daily = snapshot.daily_pnl;

    if ratio > config.max_position_ratio {
        alerts.push(RiskAlert::new(
            AlertKind::PositionLimitExceeded,
            Severity::High,
            format!(
                "Position ratio {:.2}% above maximum {:.2}%",
                ratio * 100.0,
                config.max_position_ratio * 100.0
            ),
            ratio,
            config.max_position_ratio,
            now,
        ));
    } else if ratio < config.min_position_ratio {
        alerts.push(RiskAlert::new(
            AlertKind::PositionBelowMinimum,
            Severity::Medium,
            format!(
                "Position ratio {:.2}% below minimum {:.2}%",
                ratio * 100.0,
                config.min_position_ratio * 100.0
            ),
            ratio,
            config.min_position_ratio,
            now,
        ));
    }

    if drawdown < config.max_drawdown {
        alerts.push(RiskAlert::new(
            AlertKind::MaxDrawdownExceeded,
            breach_severity(drawdown, config.max_drawdown),
            format!(
                "Drawdown {:.2}% beyond limit {:.2}%",
                drawdown * 100.0,
                config.max_drawdown * 100.0
            ),
            drawdown,
            config.max_drawdown,
            now,
        ));
    }

    if daily < config.daily_loss_limit {
        alerts.push(RiskAlert::new(
            AlertKind::DailyLossLimitExceeded,
            breach_severity(daily, config.daily_loss_limit),
            format!(
                "Daily PnL {:.2}% beyond limit {:.2}%",
                daily * 100.0,
                config.daily_loss_limit * 100.0
            ),
            daily,
            config.daily_loss_limit,
            now,
        ));
    }

    let extreme_drawdown = config.max_drawdown * EMERGENCY_BREACH_MULTIPLIER;
    if drawdown < extreme_drawdown {
        alerts.push(RiskAlert::new(
            AlertKind::ExtremeDrawdown,
            Severity::Critical,
            format!("Extreme drawdown {:.2}%", drawdown * 100.0),
            drawdown,
            extreme_drawdown,
            now,
        ));
    }

    let extreme_daily = config.daily_loss_limit * EMERGENCY_BREACH_MULTIPLIER;
    if daily < extreme_daily {
        alerts.push(RiskAlert::new(
            AlertKind::ExtremeDailyLoss,
            Severity::Critical,
            format!("Extreme daily loss {:.2}%", daily * 100.0),
            daily,
            extreme_daily,
            now,
        ));
    }

    if ratio > EMERGENCY_POSITION_RATIO {
        alerts.push(RiskAlert::new(
            AlertKind::ExtremePositionRatio,
            Severity::Critical,
            format!("Extreme position ratio {:.2}%", ratio * 100.0),
            ratio,
            EMERGENCY_POSITION_RATIO,
            now,
        ));
    }

    alerts
}

pub struct RiskEvaluator {
    config: RiskConfig,
    symbol: String,
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
    emergency: EmergencyStop,
    history: AlertHistory,
    broadcaster: Option<StatusBroadcaster>,
}

impl RiskEvaluator {
    pub fn new(
        config: RiskConfig,
        symbol: &str,
        exchange: Arc<dyn Exchange>,
        notifier: Arc<dyn Notifier>,
        emergency: EmergencyStop,
        history: AlertHistory,
    ) -> Self {
        Self {
            config,
            symbol: symbol.to_string(),
            exchange,
            notifier,
            emergency,
            history,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: StatusBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn history(&self) -> &AlertHistory {
        &self.history
    }

    /// One evaluation cycle. Skipped entirely while the emergency stop is
    /// active; an operator reset resumes evaluation.
    pub async fn run_check(&self, snapshot: &PortfolioSnapshot, now: DateTime<Utc>) -> Vec<RiskAlert> {
        if self.emergency.is_active() {
            debug!("[RISK] Emergency stop active, evaluation skipped");
            return Vec::new();
        }

        let alerts = evaluate(&self.config, snapshot, now);
        if alerts.is_empty() {
            debug!(
                "[RISK] OK ratio={:.3} drawdown={:.4} daily={:.4}",
                snapshot.metrics.position_ratio, snapshot.current_drawdown, snapshot.daily_pnl
            );
            return alerts;
        }

        self.process_alerts(&alerts).await;

        let emergencies: Vec<&str> = alerts
            .iter()
            .filter(|a| a.kind.is_emergency())
            .map(|a| a.kind.as_str())
            .collect();
        if !emergencies.is_empty() {
            self.trigger_emergency_stop(&emergencies.join(", ")).await;
        }
        alerts
    }

    /// Engages the stop, cancels every open order for the symbol and reports
    /// it. Returns `false` when the stop was already active.
    pub async fn trigger_emergency_stop(&self, reason: &str) -> bool {
        if !self.emergency.trigger(reason) {
            return false;
        }
        error!("[RISK] EMERGENCY STOP: {}", reason);

        match self.exchange.cancel_all_orders(Some(&self.symbol)).await {
            Ok(count) => info!("[RISK] Cancelled {} open orders", count),
            Err(e) => error!("[RISK] Failed to cancel open orders: {:#}", e),
        }

        let message = format!("Trading halted: {}. Manual reset required.", reason);
        if let Err(e) = self
            .notifier
            .notify_error("EMERGENCY_STOP", &message, Some(&self.symbol))
            .await
        {
            warn!("[RISK] Emergency notification failed: {:#}", e);
        }
        true
    }

    /// Records a monitoring failure as a high-severity alert.
    pub async fn record_system_error(&self, message: &str, now: DateTime<Utc>) {
        let alert = RiskAlert::new(
            AlertKind::SystemError,
            Severity::High,
            message.to_string(),
            0.0,
            0.0,
            now,
        );
        self.process_alerts(std::slice::from_ref(&alert)).await;
    }

    /// History first, then log, broadcast and notify. Delivery failures are
    /// logged only.
    pub async fn process_alerts(&self, alerts: &[RiskAlert]) {
        for alert in alerts {
            self.history.push(alert.clone());

            match alert.severity {
                Severity::Critical | Severity::High => {
                    error!("[RISK] {} ({:?}): {}", alert.kind.as_str(), alert.severity, alert.message)
                }
                _ => warn!("[RISK] {} ({:?}): {}", alert.kind.as_str(), alert.severity, alert.message),
            }

            if let Some(broadcaster) = &self.broadcaster {
                broadcaster.send(WSEvent::RiskAlert(alert.clone()));
            }

            let action = if alert.action_required {
                "EMERGENCY_STOP"
            } else {
                "MONITOR"
            };
            if let Err(e) = self
                .notifier
                .notify_risk_alert(alert.kind.as_str(), alert.current_value, alert.threshold, action)
                .await
            {
                warn!("[RISK] Alert notification failed: {:#}", e);
            }
        }
    }

    /// Evaluates the latest published snapshot every `interval`. Missing or
    /// stale snapshots are reported as system errors instead of evaluated.
    pub async fn run(
        self,
        interval: Duration,
        snapshots: watch::Receiver<Arc<PortfolioSnapshot>>,
        max_staleness: Duration,
    ) {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        info!("[RISK] Evaluator started ({}s interval)", interval.as_secs());
        loop {
            timer.tick().await;
            let snapshot = snapshots.borrow().clone();
            let now = Utc::now();
            match snapshot.updated_at {
                None => {
                    self.record_system_error("Portfolio metrics unavailable", now)
                        .await
                }
                Some(at) if (now - at).to_std().unwrap_or_default() > max_staleness => {
                    self.record_system_error(
                        &format!("Portfolio metrics stale since {}", at.format("%H:%M:%S")),
                        now,
                    )
                    .await
                }
                Some(_) => {
                    self.run_check(&snapshot, now).await;
                }
            }
        }
    }
}

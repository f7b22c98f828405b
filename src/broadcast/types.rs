use crate::risk::RiskAlert;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================
// WebSocket Event Types
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum WSEvent {
    /// Bot configuration (sent on connect)
    #[serde(rename = "config")]
    Config(serde_json::Value),

    /// Engine status projection
    #[serde(rename = "status")]
    Status(EngineStatus),

    /// Grid level table snapshot
    #[serde(rename = "grid_levels")]
    GridLevels(GridLevelsView),

    /// Order update (placed, filled, cancelled, failed)
    #[serde(rename = "order_update")]
    OrderUpdate(OrderEvent),

    /// Market price update
    #[serde(rename = "market_update")]
    MarketUpdate(MarketEvent),

    /// Risk alert raised by the evaluator
    #[serde(rename = "risk_alert")]
    RiskAlert(RiskAlert),

    /// Error notification
    #[serde(rename = "error")]
    Error(String),
}

// ============================================================
// Status Projection
// ============================================================

/// Read-only copy of the controller state for status queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub symbol: String,
    pub base_price: f64,
    pub current_price: f64,
    /// Grid spacing in percent.
    pub grid_size: f64,
    pub upper_band: f64,
    pub lower_band: f64,
    pub volatility: f64,
    pub total_profit: f64,
    pub trade_count: u64,
    pub uptime: String, // e.g. "2d 14h 30m"
    /// Level price (formatted) → exchange order id.
    pub active_orders: BTreeMap<String, String>,
    pub grid_levels_occupied: usize,
    pub emergency_stop: bool,
    pub alert_count: usize,
}

/// Grid level table for dashboard visualization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridLevelsView {
    pub symbol: String,
    pub current_price: f64,
    pub base_price: f64,
    pub levels: Vec<LevelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelInfo {
    pub index: i32,
    pub price: f64,
    pub side: String,
    pub occupied: bool,
    pub cooling_down: bool,
    /// Signed distance from the current price in percent.
    pub distance_pct: f64,
}

// ============================================================
// Order and Market Events
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub level_index: Option<i32>,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub status: String, // "OPEN", "FILLED", "CANCELED", "FAILED"
    pub profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub price: f64,
    pub volatility: f64,
}

/// Formats uptime as "Xd Yh Zm", "Xh Ym" or "Xm Ys".
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds)
    }
}

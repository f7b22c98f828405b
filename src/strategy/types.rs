use crate::model::OrderSide;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            SignalAction::Buy => Some(OrderSide::Buy),
            SignalAction::Sell => Some(OrderSide::Sell),
            SignalAction::Hold => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Outcome of one strategy evaluation.
///
/// For `Buy`/`Sell`, `target_ratio` is the position ratio the adjustment
/// moves toward and `total_value` the portfolio value it is sized against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub action: SignalAction,
    pub price: f64,
    pub current_ratio: f64,
    pub target_ratio: f64,
    pub total_value: f64,
    pub reason: String,
}

impl StrategySignal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            price: 0.0,
            current_ratio: 0.0,
            target_ratio: 0.0,
            total_value: 0.0,
            reason: reason.into(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }

    /// Base amount that moves the position from the current to the target ratio.
    pub fn adjustment_amount(&self) -> f64 {
        if self.price <= 0.0 {
            return 0.0;
        }
        self.total_value * (self.current_ratio - self.target_ratio).abs() / self.price
    }
}

//! Central configuration constants for grid-trading-bot.
//!
//! Tunable parameters and magic numbers used throughout the bot. Values that
//! operators commonly change live in the TOML config instead; these are the
//! fixed rules of the control loop.

use std::time::Duration;

// =============================================================================
// GRID CONSTANTS
// =============================================================================

/// Number of levels generated on each side of the base price.
pub const LEVELS_PER_SIDE: i32 = 5;

/// Grid level prices are rounded to this many decimals and keyed by it.
pub const LEVEL_PRICE_DECIMALS: u32 = 4;

/// Absolute drift of the lowest level price that forces a table rebuild.
pub const LEVEL_REBUILD_THRESHOLD: f64 = 1.0;

/// A buy level must sit at least 0.1% below the current price.
pub const BUY_GUARD_MULTIPLIER: f64 = 0.999;

/// A sell level must sit at least 0.1% above the current price.
pub const SELL_GUARD_MULTIPLIER: f64 = 1.001;

/// Share of the free balance committed to a single grid order.
pub const ORDER_BALANCE_FRACTION: f64 = 0.1;

/// Relative slack on the minimum notional check so a size computed exactly at
/// the minimum survives precision rounding.
pub const MIN_NOTIONAL_TOLERANCE: f64 = 0.99;

/// Minimum grid size change (percentage points) worth applying.
pub const GRID_SIZE_HYSTERESIS: f64 = 0.1;

// =============================================================================
// VOLATILITY CONSTANTS
// =============================================================================

/// Price history cap (24h of 5-minute samples).
pub const PRICE_HISTORY_CAP: usize = 288;

/// Samples used for the volatility estimate.
pub const VOLATILITY_WINDOW: usize = 24;

/// Annualization factor applied to the return deviation.
pub const VOLATILITY_ANNUALIZATION: f64 = 24.0 * 365.0;

/// Base grid adjustment interval before volatility scaling (1 hour).
pub const BASE_ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(60 * 60);

// =============================================================================
// RISK CONSTANTS
// =============================================================================

/// Breach multiple at which drawdown or daily-loss alerts become critical.
pub const CRITICAL_BREACH_MULTIPLIER: f64 = 1.5;

/// Breach multiple at which drawdown or daily loss triggers the emergency stop.
pub const EMERGENCY_BREACH_MULTIPLIER: f64 = 2.0;

/// Position ratio that triggers the emergency stop on its own.
pub const EMERGENCY_POSITION_RATIO: f64 = 0.95;

/// Alert history capacity (oldest evicted first).
pub const ALERT_HISTORY_CAP: usize = 100;

/// Length of the daily PnL window.
pub const DAILY_RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// STRATEGY CONSTANTS
// =============================================================================

/// Refresh period for the breakout high/low levels (~23.9h).
pub const BREAKOUT_REFRESH_INTERVAL: Duration = Duration::from_secs(86_040);

// =============================================================================
// ENGINE TIMER INTERVALS
// =============================================================================

/// Interval for broadcasting status updates (5 seconds)
pub const STATUS_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period for the reporter to drain pending messages on shutdown.
pub const REPORTER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// NOTIFICATION CONSTANTS
// =============================================================================

/// Telegram message length limit.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Delivery attempts per Telegram message.
pub const NOTIFICATION_RETRY_ATTEMPTS: u32 = 3;

/// Delay between Telegram delivery attempts.
pub const NOTIFICATION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Sliding window used by the notification rate limiter.
pub const NOTIFICATION_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Pending notifications held by the Telegram worker queue.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

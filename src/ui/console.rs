//! Console renderer for dry-run and trade history output.

use crate::broadcast::{EngineStatus, GridLevelsView, LevelInfo};
use crate::config::BotConfig;
use crate::model::TradeRecord;

pub struct ConsoleRenderer;

impl ConsoleRenderer {
    /// Render a complete dry-run report to stdout.
    pub fn render(config: &BotConfig, status: &EngineStatus, levels: &GridLevelsView) {
        println!();
        println!("{}", "=".repeat(72));
        println!(" GRID DRY RUN REPORT");
        println!("{}", "=".repeat(72));

        println!();
        Self::render_levels(levels);

        println!();
        println!("{}", "-".repeat(72));
        Self::render_orders(status);

        println!();
        println!("{}", "=".repeat(72));
        Self::render_config(config);

        println!();
        println!("{}", "-".repeat(72));
        Self::render_status(status);

        println!();
        println!("{}", "=".repeat(72));
        println!();
    }

    fn render_config(config: &BotConfig) {
        println!("CONFIGURATION");
        println!("Symbol:      {}", config.trading.symbol);
        println!("Mode:        {}", config.trading.mode);
        if config.trading.leverage > 1 {
            println!("Leverage:    {}x", config.trading.leverage);
        }
        println!("Min Trade:   {:.2}", config.trading.min_trade_amount);
        println!(
            "Grid Size:   {:.2}% ({:.2}% - {:.2}%, dynamic: {})",
            config.grid.initial_size,
            config.grid.min_size,
            config.grid.max_size,
            config.grid.dynamic_adjustment
        );
        println!(
            "Risk:        drawdown {:.1}% | daily loss {:.1}% | position {:.0}%-{:.0}%",
            config.risk.max_drawdown * 100.0,
            config.risk.daily_loss_limit * 100.0,
            config.risk.min_position_ratio * 100.0,
            config.risk.max_position_ratio * 100.0
        );
    }

    fn render_status(s: &EngineStatus) {
        println!("STATUS: {}", s.symbol);
        println!("Price:    {:.4} (base {:.4})", s.current_price, s.base_price);
        println!(
            "Bands:    {:.4} - {:.4} at {:.2}%",
            s.lower_band, s.upper_band, s.grid_size
        );
        println!("Vol:      {:.4}", s.volatility);
        println!("Profit:   {:.4} over {} trades", s.total_profit, s.trade_count);
        if s.emergency_stop {
            println!("State:    EMERGENCY STOP");
        }
    }

    fn render_levels(view: &GridLevelsView) {
        println!("GRID LEVELS ({} levels)", view.levels.len());
        println!(
            "{:<5} | {:<14} | {:<6} | {:<9} | STATUS",
            "IDX", "PRICE", "SIDE", "DIST %"
        );
        println!("{}", "-".repeat(56));

        // Highest price first so the table reads like an order book.
        for level in view.levels.iter().rev() {
            println!(
                "{:<+5} | {:<14.4} | {:<6} | {:<+9.3} | {}",
                level.index,
                level.price,
                level.side,
                level.distance_pct,
                level_status(level)
            );
        }
    }

    fn render_orders(status: &EngineStatus) {
        println!("ORDERS PLACED THIS TICK:");

        if status.active_orders.is_empty() {
            println!("  [WAIT] No level was eligible for an order.");
            return;
        }
        for (price, id) in &status.active_orders {
            println!("  [ORDER] {} -> {}", price, id);
        }
    }

    /// Render trade history, oldest first.
    pub fn render_trades(trades: &[TradeRecord]) {
        if trades.is_empty() {
            println!("No trades recorded.");
            return;
        }
        println!(
            "{:<20} | {:<10} | {:<4} | {:<14} | {:<12} | {:<12} | STRATEGY",
            "TIME", "SYMBOL", "SIDE", "PRICE", "AMOUNT", "PROFIT"
        );
        println!("{}", "-".repeat(96));
        for t in trades {
            println!(
                "{:<20} | {:<10} | {:<4} | {:<14.4} | {:<12.6} | {:<12.4} | {}",
                t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                t.symbol,
                t.side,
                t.price,
                t.amount,
                t.profit,
                t.strategy
            );
        }
        let profit: f64 = trades.iter().map(|t| t.profit).sum();
        println!("{}", "-".repeat(96));
        println!("{} trades, realized profit {:.4}", trades.len(), profit);
    }
}

fn level_status(level: &LevelInfo) -> &'static str {
    if level.occupied {
        "ACTIVE"
    } else if level.cooling_down {
        "COOLDOWN"
    } else {
        "WAITING"
    }
}

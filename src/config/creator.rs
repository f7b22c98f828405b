use crate::config::BotConfig;
use crate::model::TradingMode;
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use std::fs;

pub fn create_config() -> Result<()> {
    let theme = ColorfulTheme::default();
    let mut config = BotConfig::default();

    let modes = vec!["Spot", "Futures"];
    let selection = Select::with_theme(&theme)
        .with_prompt("Trading mode")
        .default(0)
        .items(&modes)
        .interact()?;
    config.trading.mode = if selection == 0 {
        TradingMode::Spot
    } else {
        TradingMode::Futures
    };

    config.trading.symbol = Input::with_theme(&theme)
        .with_prompt("Symbol (e.g., BNB/USDT)")
        .default(config.trading.symbol.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            match input.split_once('/') {
                Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(()),
                _ => Err("Symbol must be in Base/Quote format"),
            }
        })
        .interact_text()?;

    if config.trading.mode == TradingMode::Futures {
        config.trading.leverage = Input::with_theme(&theme)
            .with_prompt("Leverage (1-125)")
            .default(1u32)
            .validate_with(|input: &u32| -> Result<(), &str> {
                if (1..=125).contains(input) {
                    Ok(())
                } else {
                    Err("Leverage must be between 1 and 125")
                }
            })
            .interact_text()?;
    }

    config.trading.min_trade_amount = Input::with_theme(&theme)
        .with_prompt("Minimum trade amount (quote)")
        .default(config.trading.min_trade_amount)
        .interact_text()?;

    let min_size: f64 = Input::with_theme(&theme)
        .with_prompt("Minimum grid size (%)")
        .default(config.grid.min_size)
        .interact_text()?;

    let max_size: f64 = Input::with_theme(&theme)
        .with_prompt("Maximum grid size (%)")
        .default(config.grid.max_size)
        .validate_with(|input: &f64| -> Result<(), &str> {
            if *input > min_size && *input <= 10.0 {
                Ok(())
            } else {
                Err("Maximum must exceed the minimum and be at most 10")
            }
        })
        .interact_text()?;

    let initial_size: f64 = Input::with_theme(&theme)
        .with_prompt("Initial grid size (%)")
        .default(config.grid.initial_size.clamp(min_size, max_size))
        .validate_with(|input: &f64| -> Result<(), &str> {
            if *input >= min_size && *input <= max_size {
                Ok(())
            } else {
                Err("Initial size must lie between the minimum and maximum")
            }
        })
        .interact_text()?;

    config.grid.min_size = min_size;
    config.grid.max_size = max_size;
    config.grid.initial_size = initial_size;
    config.grid.dynamic_adjustment = Confirm::with_theme(&theme)
        .with_prompt("Adapt grid size to volatility?")
        .default(true)
        .interact()?;

    config.risk.max_drawdown = -Input::with_theme(&theme)
        .with_prompt("Maximum drawdown (%)")
        .default(config.risk.max_drawdown.abs() * 100.0)
        .interact_text()?
        / 100.0;

    config.risk.daily_loss_limit = -Input::with_theme(&theme)
        .with_prompt("Daily loss limit (%)")
        .default(config.risk.daily_loss_limit.abs() * 100.0)
        .interact_text()?
        / 100.0;

    config.strategies.breakout.enabled = Confirm::with_theme(&theme)
        .with_prompt("Enable the breakout rebalancer?")
        .default(true)
        .interact()?;

    config.validate()?;

    let default_filename = format!(
        "{}_{}_grid.toml",
        config.trading.mode,
        config.trading.symbol.replace('/', "_").to_lowercase()
    );
    let filename: String = Input::with_theme(&theme)
        .with_prompt("Configuration filename")
        .default(default_filename)
        .interact_text()?;

    let path = if filename.ends_with(".toml") {
        filename
    } else {
        format!("{}.toml", filename)
    };

    // Bare filenames go into configs/ when that directory exists.
    let final_path = if !path.contains('/') && fs::metadata("configs").is_ok() {
        format!("configs/{}", path)
    } else {
        path
    };

    fs::write(&final_path, toml::to_string_pretty(&config)?)?;
    println!("Configuration saved to {}", final_path);

    Ok(())
}

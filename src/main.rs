use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use grid_trading_bot::broadcast::{StatusBroadcaster, WSEvent};
use grid_trading_bot::config::broadcast::load_broadcast_config;
use grid_trading_bot::config::exchange::{load_exchange_config, ExchangeConfig};
use grid_trading_bot::config::simulation::{load_simulation_config, SimulationConfig};
use grid_trading_bot::config::{load_config, BotConfig, LoggingConfig};
use grid_trading_bot::constants::REPORTER_DRAIN_TIMEOUT;
use grid_trading_bot::engine::{EngineDeps, GridEngine};
use grid_trading_bot::exchange::init_exchange;
use grid_trading_bot::persistence::{DryRunStore, JsonStateStore, StateStore};
use grid_trading_bot::reporter::{init_notifier, LogNotifier, Notifier};
use grid_trading_bot::risk::{AlertHistory, EmergencyStop};
use grid_trading_bot::ui::console::ConsoleRenderer;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Volatility-adaptive grid trading bot", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    list_strategies: bool,

    #[arg(long)]
    create: bool,

    #[arg(long)]
    ws_port: Option<u16>,

    /// Initialize and run one tick against the paper exchange, then print a report
    #[arg(long)]
    dry_run: bool,

    /// Print the N most recent trades and exit
    #[arg(long, value_name = "N")]
    trades: Option<usize>,

    /// Notification backend: log or telegram (overrides [notifications].channel)
    #[arg(long)]
    notifier: Option<String>,
}

fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(&config.directory, "grid-bot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let directive = format!("{},grid_trading_bot={}", config.level, config.level);

    // Console Layer (Env Filter)
    let console_filter = match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::EnvFilter::from_default_env(),
        Err(_) => tracing_subscriber::EnvFilter::try_new(&directive)
            .with_context(|| format!("Invalid log level '{}'", config.level))?,
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_filter(console_filter);

    // File Layer (Simple Text)
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::try_new(&directive)?);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.list_strategies {
        grid_trading_bot::config::strategy::print_strategy_help();
        return Ok(());
    }

    if args.create {
        if let Err(e) = grid_trading_bot::config::creator::create_config() {
            eprintln!("Error creating config: {:#}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config_path = args.config.ok_or_else(|| {
        anyhow::anyhow!("Config file is required unless --list-strategies or --create is used")
    })?;
    let mut config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(channel) = args.notifier {
        config.notifications.channel = channel;
        config.notifications.validate()?;
    }

    let _guard = init_logging(&config.logging)?;
    info!("Loaded config from: {}", config_path);

    if let Some(limit) = args.trades {
        let store = JsonStateStore::new(&config.data)?;
        ConsoleRenderer::render_trades(&store.trade_history(limit)?);
        return Ok(());
    }

    let exchange_config = match load_exchange_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load exchange config: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Exchange config loaded: {} ({})",
        exchange_config.kind, exchange_config.network
    );
    let sim_config = load_simulation_config(None);

    // --- DRY RUN MODE ---
    if args.dry_run {
        info!("[SIMULATION] Running in dry-run mode...");
        return run_dry_run(config, sim_config).await;
    }

    // --- LIVE MODE ---
    let broadcast_config = match load_broadcast_config(args.ws_port) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load broadcast config: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting {} grid for {}",
        config.trading.mode,
        config.symbol()
    );

    let broadcaster = StatusBroadcaster::new(broadcast_config.websocket.clone());
    if let Some(conf) = &broadcast_config.websocket {
        info!("WebSocket Status Server enabled on {}:{}", conf.host, conf.port);
    }
    broadcaster.send(WSEvent::Config(serde_json::to_value(&config)?));

    let emergency = EmergencyStop::new(config.risk.reset_token.clone());
    if config.risk.reset_token.is_none() {
        warn!("No RISK_RESET_TOKEN configured: an emergency stop can only be cleared by restarting");
    }

    let (notifier, reporter_handle) = match init_notifier(
        &config.notifications,
        broadcast_config.telegram,
        broadcaster.subscribe(),
        emergency.clone(),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Notifier initialization failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run_live(
        config,
        exchange_config,
        sim_config,
        broadcaster.clone(),
        notifier.clone(),
        emergency,
    )
    .await
    {
        error!("Engine error: {:#}", e);
        broadcaster.send(WSEvent::Error(e.to_string()));
        if let Err(notify_err) = notifier.notify_error("ENGINE", &format!("{:#}", e), None).await {
            warn!("Error notification failed: {:#}", notify_err);
        }
        drain_reporter(notifier, reporter_handle).await;
        std::process::exit(1);
    }

    drain_reporter(notifier, reporter_handle).await;
    Ok(())
}

async fn run_live(
    config: BotConfig,
    exchange_config: ExchangeConfig,
    sim_config: SimulationConfig,
    broadcaster: StatusBroadcaster,
    notifier: Arc<dyn Notifier>,
    emergency: EmergencyStop,
) -> Result<()> {
    let exchange = init_exchange(&exchange_config, &config.trading, &sim_config)?;
    let store = Arc::new(JsonStateStore::new(&config.data)?);
    let deps = EngineDeps {
        exchange,
        notifier,
        store,
        broadcaster,
        emergency,
        alerts: AlertHistory::default(),
    };
    GridEngine::new(config, deps)?.run().await
}

/// Lets the notification worker flush queued messages before exit.
async fn drain_reporter(notifier: Arc<dyn Notifier>, handle: Option<JoinHandle<()>>) {
    // The worker stops once the last queue sender is gone.
    drop(notifier);
    if let Some(handle) = handle {
        info!("Waiting for notification worker to shut down...");
        if tokio::time::timeout(REPORTER_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("Notification worker did not finish within {:?}", REPORTER_DRAIN_TIMEOUT);
        }
    }
}

/// One initialize + tick against the paper exchange. Persisted state is read
/// but never written.
async fn run_dry_run(config: BotConfig, sim_config: SimulationConfig) -> Result<()> {
    info!(
        "[SIMULATION] Mode: balance={:?} price={:.4}",
        sim_config.balance_mode, sim_config.initial_price
    );

    let exchange = init_exchange(&ExchangeConfig::default(), &config.trading, &sim_config)?;
    let deps = EngineDeps {
        exchange,
        notifier: Arc::new(LogNotifier::new(&config.notifications)),
        store: Arc::new(DryRunStore::new(JsonStateStore::new(&config.data)?)),
        broadcaster: StatusBroadcaster::new(None),
        emergency: EmergencyStop::new(None),
        alerts: AlertHistory::default(),
    };
    let mut engine = GridEngine::new(config, deps)?;

    let now = Utc::now();
    if let Err(e) = engine.initialize(now).await {
        error!("Simulation engine initialization failed: {:#}", e);
        std::process::exit(1);
    }
    if let Err(e) = engine.tick_at(now).await {
        error!("Simulation run failed: {:#}", e);
        std::process::exit(1);
    }

    ConsoleRenderer::render(engine.config(), &engine.status(), &engine.grid_levels_view(now));
    Ok(())
}

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use futures_position_bot::bybit::{BybitAuth, BybitClient, BybitStreams};
use futures_position_bot::config::{Config, LoggingConfig};
use futures_position_bot::repository::{ConfigRepository, StrategyRepository};
use futures_position_bot::strategy::{create_trade_logic, StrategyRunner};
use futures_position_bot::telegram::{Notifications, TelegramNotifier};

fn init_logging(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_notifications(config: &Config) -> Notifications {
    if !config.telegram.enabled {
        info!("📱 Telegram notifications disabled in config");
        return Notifications::disabled();
    }
    match (&config.telegram.bot_token, &config.telegram.chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() => {
            info!("📱 Telegram notifications enabled");
            Notifications::new(Arc::new(TelegramNotifier::new(token.clone())), chat_id.clone())
        }
        _ => {
            info!("📱 Telegram bot_token or chat_id missing, notifications disabled");
            Notifications::disabled()
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("🚀 Futures position bot starting...");

    let repository = ConfigRepository::new(config.clone());
    let strategy = repository
        .active_strategy()
        .ok_or_else(|| anyhow!("no active strategy configured"))?;
    let connection = repository
        .active_connection()
        .ok_or_else(|| anyhow!("BYBIT_API_KEY / BYBIT_API_SECRET not configured"))?;

    info!("✅ Configuration loaded");
    info!("   Strategy: {} ({:?})", strategy.name, strategy.kind);
    info!("   Testnet: {}", connection.testnet);
    info!("   REST URL: {}", config.bybit.rest_url);

    let auth = BybitAuth::new(connection.api_key, connection.api_secret);
    let exchange = Arc::new(BybitClient::new(
        config.bybit.rest_url.clone(),
        Some(auth.clone()),
        config.bybit.recv_window,
    )?);
    info!("✅ REST client initialized");

    let streams = Arc::new(BybitStreams::new(
        config.bybit.public_ws_url.clone(),
        config.bybit.private_ws_url.clone(),
        Some(auth),
    ));
    streams.connect();

    let notifications = build_notifications(&config);
    let logic = create_trade_logic(&strategy, exchange, streams.clone(), notifications);

    let runner = StrategyRunner::new();
    if let Err(e) = runner.start(logic).await {
        error!("❌ Strategy failed to start: {}", e);
        streams.shutdown().await;
        return Err(e.into());
    }
    info!("✅ Strategy {} running", strategy.name);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = runner.stop(false).await {
        warn!("Strategy stop incomplete: {}", e);
    }
    streams.shutdown().await;

    info!("👋 Bot stopped");
    Ok(())
}

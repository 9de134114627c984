use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::exchange::{MarginType, PositionSide};
use crate::signal::{RequiredStrength, SignalOptions};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bybit: BybitConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BybitConfig {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_public_ws_url")]
    pub public_ws_url: String,
    #[serde(default = "default_private_ws_url")]
    pub private_ws_url: String,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
}

fn default_rest_url() -> String { "https://api.bybit.com".to_string() }
fn default_public_ws_url() -> String { "wss://stream.bybit.com/v5/public/linear".to_string() }
fn default_private_ws_url() -> String { "wss://stream.bybit.com/v5/private".to_string() }
fn default_recv_window() -> u64 { 5000 }

const TESTNET_REST_URL: &str = "https://api-testnet.bybit.com";
const TESTNET_PUBLIC_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";
const TESTNET_PRIVATE_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/private";

impl BybitConfig {
    /// Point endpoints left at their mainnet defaults to testnet.
    fn apply_testnet(&mut self) {
        if !self.testnet {
            return;
        }
        if self.rest_url == default_rest_url() {
            self.rest_url = TESTNET_REST_URL.to_string();
        }
        if self.public_ws_url == default_public_ws_url() {
            self.public_ws_url = TESTNET_PUBLIC_WS_URL.to_string();
        }
        if self.private_ws_url == default_private_ws_url() {
            self.private_ws_url = TESTNET_PRIVATE_WS_URL.to_string();
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Strategy variants sharing the trading core.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradeLogicKind {
    /// Averages whenever ROE sits inside the configured band.
    #[default]
    PercentLimit,
    /// Additionally requires price to have moved a set percent from the last fill.
    PercentMove,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_strategy_name")]
    pub name: String,
    #[serde(default)]
    pub kind: TradeLogicKind,
    #[serde(default)]
    pub options: TradeLogicOptions,
}

fn default_strategy_name() -> String { "default".to_string() }

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            active: false,
            name: default_strategy_name(),
            kind: TradeLogicKind::default(),
            options: TradeLogicOptions::default(),
        }
    }
}

/// Which position sides a strategy may open.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SideFilter {
    Long,
    Short,
    #[default]
    Both,
}

impl SideFilter {
    pub fn allows(&self, side: PositionSide) -> bool {
        match self {
            SideFilter::Long => side == PositionSide::Long,
            SideFilter::Short => side == PositionSide::Short,
            SideFilter::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct TrailingStopOptions {
    /// ROE (percent) at which the trailing stop arms.
    pub activation_roe: f64,
    /// Callback distance in percent of price.
    pub callback_rate: f64,
}

/// Conditions for placing a protective stop-market order. Every present
/// condition must hold; absent ones are ignored.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct MarketStopOptions {
    pub min_roe: Option<f64>,
    pub after_secs: Option<u64>,
    /// Place the stop once available balance falls to this percent of wallet.
    pub max_available_balance_percent: Option<f64>,
    /// ROE locked in by the stop trigger price.
    #[serde(default)]
    pub lock_roe: f64,
}

impl MarketStopOptions {
    pub fn has_conditions(&self) -> bool {
        self.min_roe.is_some() || self.after_secs.is_some() || self.max_available_balance_percent.is_some()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RetryOptions {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Added to the margin basis on every min-notional rejection, as percent of the first basis.
    #[serde(default = "default_margin_step_percent")]
    pub margin_step_percent: f64,
    /// Leverage reduction on every max-leverage rejection.
    #[serde(default = "default_leverage_step")]
    pub leverage_step: u32,
}

fn default_max_attempts() -> u32 { 5 }
fn default_margin_step_percent() -> f64 { 25.0 }
fn default_leverage_step() -> u32 { 1 }

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            margin_step_percent: default_margin_step_percent(),
            leverage_step: default_leverage_step(),
        }
    }
}

/// Numeric thresholds of a running strategy. Immutable while it runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeLogicOptions {
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_type: MarginType,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_positions_per_cycle")]
    pub max_positions_per_cycle: usize,
    /// Margin per new position, percent of available balance.
    #[serde(default = "default_margin_percent")]
    pub margin_percent: f64,
    /// Margin per averaging order, percent of available balance.
    #[serde(default = "default_margin_percent")]
    pub average_margin_percent: f64,
    #[serde(default = "default_average_roe_from")]
    pub average_roe_from: f64,
    #[serde(default = "default_average_roe_to")]
    pub average_roe_to: f64,
    /// Adverse move from the last fill required before averaging (percent-move variant).
    #[serde(default = "default_average_percent_move")]
    pub average_percent_move: f64,
    #[serde(default)]
    pub allowed_sides: SideFilter,
    #[serde(default)]
    pub min_quote_volume: f64,
    #[serde(default)]
    pub min_trade_count: usize,
    /// Dominant/other taker-volume ratio required to open. 0 disables.
    #[serde(default)]
    pub volume_imbalance_coefficient: f64,

    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    #[serde(default = "default_bucket_count")]
    pub min_distinct_prices: usize,
    /// Reject signals whose POC sits in a wick.
    #[serde(default)]
    pub strict_poc_in_body: bool,
    #[serde(default = "default_open_strength")]
    pub open_min_strength: RequiredStrength,
    #[serde(default)]
    pub average_min_strength: RequiredStrength,

    #[serde(default = "default_kline_interval")]
    pub kline_interval_minutes: u32,
    #[serde(default = "default_volume_ma_period")]
    pub volume_ma_period: usize,
    /// Candle volume must reach this multiple of its volume average.
    #[serde(default = "default_volume_ma_coefficient")]
    pub volume_ma_coefficient: f64,
    #[serde(default = "default_depth_percent")]
    pub depth_percent: f64,
    #[serde(default = "default_depth_limit")]
    pub depth_limit: usize,
    #[serde(default = "default_scan_parallelism")]
    pub scan_parallelism: usize,
    #[serde(default = "default_instance_interval")]
    pub instance_interval_secs: u64,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,

    pub take_profit_roe: Option<f64>,
    /// Close at market once ROE drops to this (negative) value.
    pub force_close_roe: Option<f64>,
    pub trailing_stop: Option<TrailingStopOptions>,
    pub market_stop: Option<MarketStopOptions>,
    #[serde(default)]
    pub retry: RetryOptions,
    #[serde(default = "default_true")]
    pub notify_summary: bool,
}

fn default_leverage() -> u32 { 10 }
fn default_max_positions() -> usize { 10 }
fn default_max_positions_per_cycle() -> usize { 3 }
fn default_margin_percent() -> f64 { 2.0 }
fn default_average_roe_from() -> f64 { -8.0 }
fn default_average_roe_to() -> f64 { -2.0 }
fn default_average_percent_move() -> f64 { 1.5 }
fn default_bucket_count() -> usize { 5 }
fn default_open_strength() -> RequiredStrength { RequiredStrength::Strong }
fn default_kline_interval() -> u32 { 5 }
fn default_volume_ma_period() -> usize { 20 }
fn default_volume_ma_coefficient() -> f64 { 1.5 }
fn default_depth_percent() -> f64 { 1.0 }
fn default_depth_limit() -> usize { 50 }
fn default_scan_parallelism() -> usize { 4 }
fn default_instance_interval() -> u64 { 60 }
fn default_quote_asset() -> String { "USDT".to_string() }
fn default_true() -> bool { true }

impl Default for TradeLogicOptions {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            margin_type: MarginType::default(),
            max_positions: default_max_positions(),
            max_positions_per_cycle: default_max_positions_per_cycle(),
            margin_percent: default_margin_percent(),
            average_margin_percent: default_margin_percent(),
            average_roe_from: default_average_roe_from(),
            average_roe_to: default_average_roe_to(),
            average_percent_move: default_average_percent_move(),
            allowed_sides: SideFilter::default(),
            min_quote_volume: 0.0,
            min_trade_count: 0,
            volume_imbalance_coefficient: 0.0,
            bucket_count: default_bucket_count(),
            min_distinct_prices: default_bucket_count(),
            strict_poc_in_body: false,
            open_min_strength: default_open_strength(),
            average_min_strength: RequiredStrength::default(),
            kline_interval_minutes: default_kline_interval(),
            volume_ma_period: default_volume_ma_period(),
            volume_ma_coefficient: default_volume_ma_coefficient(),
            depth_percent: default_depth_percent(),
            depth_limit: default_depth_limit(),
            scan_parallelism: default_scan_parallelism(),
            instance_interval_secs: default_instance_interval(),
            quote_asset: default_quote_asset(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            take_profit_roe: None,
            force_close_roe: None,
            trailing_stop: None,
            market_stop: None,
            retry: RetryOptions::default(),
            notify_summary: true,
        }
    }
}

impl TradeLogicOptions {
    pub fn signal_options(&self) -> SignalOptions {
        SignalOptions {
            bucket_count: self.bucket_count,
            min_distinct_prices: self.min_distinct_prices,
            depth_percent: self.depth_percent,
        }
    }

    /// Whether `symbol` belongs to the evaluation universe.
    pub fn accepts_symbol(&self, symbol: &str) -> bool {
        if !symbol.ends_with(&self.quote_asset) {
            return false;
        }
        if self.blacklist.iter().any(|s| s == symbol) {
            return false;
        }
        self.whitelist.is_empty() || self.whitelist.iter().any(|s| s == symbol)
    }
}

impl Config {
    pub fn load() -> Result<Arc<Self>> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("BOT").separator("__"));

        // Secrets come from the environment
        if let Ok(api_key) = std::env::var("BYBIT_API_KEY") {
            builder = builder.set_override("bybit.api_key", api_key)?;
        }

        if let Ok(api_secret) = std::env::var("BYBIT_API_SECRET") {
            builder = builder.set_override("bybit.api_secret", api_secret)?;
        }

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            builder = builder.set_override("telegram.bot_token", token)?;
        }

        let mut config: Config = builder.build()?.try_deserialize()?;
        config.bybit.apply_testnet();
        Ok(Arc::new(config))
    }
}

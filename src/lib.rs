pub mod config;
pub mod error;
pub mod exchange;
pub mod bybit;
pub mod calculator;
pub mod signal;
pub mod position;
pub mod filters;
pub mod execution;
pub mod strategy;
pub mod telegram;
pub mod repository;

pub use config::Config;
pub use bybit::{BybitAuth, BybitClient, BybitStreams};
pub use error::{ExchangeError, TradeError, TradeResult};
pub use telegram::{Notifications, TelegramNotifier};

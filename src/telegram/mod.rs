use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::exchange::PositionSide;
use crate::position::Position;

/// Outbound chat channel. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()>;
}

pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, bot_token }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": channel_id,
                "text": text,
                "parse_mode": "HTML"
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            bail!("telegram responded {}", response.status());
        }
        Ok(())
    }
}

/// Fire-and-forget publisher bound to one channel. Without a notifier
/// every message is dropped.
#[derive(Clone, Default)]
pub struct Notifications {
    notifier: Option<Arc<dyn Notifier>>,
    channel_id: String,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, channel_id: impl Into<String>) -> Self {
        Self {
            notifier: Some(notifier),
            channel_id: channel_id.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Send in the background; failures are only logged.
    pub fn publish(&self, text: String) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let channel_id = self.channel_id.clone();
        tokio::spawn(async move {
            match notifier.send_message(&channel_id, &text).await {
                Ok(()) => debug!("📱 Notification sent"),
                Err(e) => warn!("📱 Notification failed: {}", e),
            }
        });
    }
}

fn side_emoji(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "🟢",
        PositionSide::Short => "🔴",
    }
}

pub fn format_startup(strategy: &str, positions: usize) -> String {
    format!(
        "🤖 <b>Strategy Started</b>\n\n\
         🧠 Strategy: {}\n\
         📂 Reconciled positions: {}",
        strategy, positions
    )
}

pub fn format_shutdown(strategy: &str, forced: bool) -> String {
    format!(
        "🛑 <b>Strategy Stopped</b>\n\n\
         🧠 Strategy: {}\n\
         {}",
        strategy,
        if forced { "⚠️ Forced: positions left untouched" } else { "✅ Stop orders cancelled" }
    )
}

pub fn format_position_opened(position: &Position) -> String {
    format!(
        "📍 <b>Position Opened</b>\n\n\
         📊 Symbol: {}\n\
         {} Side: <b>{}</b>\n\
         🎯 Entry: {}\n\
         🔢 Qty: {}\n\
         ⚙️ Leverage: {}x",
        position.symbol,
        side_emoji(position.side),
        position.side,
        position.entry_price,
        position.total_quantity,
        position.leverage
    )
}

pub fn format_position_averaged(position: &Position) -> String {
    format!(
        "➕ <b>Position Averaged</b>\n\n\
         📊 Symbol: {}\n\
         {} Side: <b>{}</b>\n\
         🎯 New entry: {}\n\
         🔢 Total qty: {}",
        position.symbol,
        side_emoji(position.side),
        position.side,
        position.entry_price,
        position.total_quantity
    )
}

pub fn format_position_closed(position: &Position, exit_price: f64, realized_profit: f64) -> String {
    let pnl_emoji = if realized_profit >= 0.0 { "💰" } else { "📉" };
    format!(
        "🔒 <b>Position Closed</b>\n\n\
         📊 Symbol: {}\n\
         {} Side: <b>{}</b>\n\
         🚪 Entry: {}\n\
         🚪 Exit: {}\n\
         {} PnL: {:.4}",
        position.symbol,
        side_emoji(position.side),
        position.side,
        position.entry_price,
        exit_price,
        pnl_emoji,
        realized_profit
    )
}

pub fn format_order_failed(symbol: &str, side: PositionSide, action: &str, error: &str) -> String {
    format!(
        "❌ <b>Order Failed</b>\n\n\
         📊 Symbol: {}\n\
         {} Side: <b>{}</b>\n\
         📝 Action: {}\n\
         ⚠️ Error: {}",
        symbol,
        side_emoji(side),
        side,
        action,
        error
    )
}

/// Per-cycle report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub evaluated: usize,
    pub candidates: usize,
    pub opened: usize,
    pub averaged: usize,
    pub failed: usize,
    pub open_positions: usize,
    pub available_balance_percent: f64,
}

pub fn format_cycle_summary(strategy: &str, summary: &CycleSummary) -> String {
    format!(
        "📊 <b>{} cycle</b>\n\n\
         🔎 Evaluated: {}\n\
         🎯 Candidates: {}\n\
         📍 Opened: {}\n\
         ➕ Averaged: {}\n\
         ❌ Failed: {}\n\
         📂 Open positions: {}\n\
         💵 Available balance: {:.1}%",
        strategy,
        summary.evaluated,
        summary.candidates,
        summary.opened,
        summary.averaged,
        summary.failed,
        summary.open_positions,
        summary.available_balance_percent
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
            self.sent.lock().push((channel_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_is_fire_and_forget() {
        let recorder = Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        let notifications = Notifications::new(recorder.clone(), "42");

        notifications.publish("hello".to_string());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(recorder.sent.lock().as_slice(), &[("42".to_string(), "hello".to_string())]);
    }

    #[tokio::test]
    async fn test_disabled_drops_messages() {
        let notifications = Notifications::disabled();
        assert!(!notifications.is_enabled());
        notifications.publish("ignored".to_string());
    }

    #[test]
    fn test_closed_message_shows_pnl() {
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            side: PositionSide::Short,
            entry_price: 100.0,
            total_quantity: 0.0,
            leverage: 10,
            last_order_price: 100.0,
            update_time: 0,
        };
        let text = format_position_closed(&position, 95.0, 5.0);
        assert!(text.contains("BTCUSDT"));
        assert!(text.contains("5.0000"));
        assert!(text.contains("🔴"));
    }
}

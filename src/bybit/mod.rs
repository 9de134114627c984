//! Live Bybit v5 (USDT linear) implementation of the exchange seams.

pub mod auth;
pub mod rest;
pub mod types;
pub mod websocket;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{ExchangeError, ExchangeErrorKind};
use crate::exchange::{
    ExchangeResult, MarketStream, OrderSide, OrderUpdate, PositionSide, Tick,
};

pub use auth::BybitAuth;
pub use rest::BybitClient;
pub use types::*;
pub use websocket::{BybitWebSocket, MessageHandler};

const ORDER_TOPIC: &str = "order";

fn ticker_topic(symbol: &str) -> String {
    format!("tickers.{}", symbol)
}

/// Turns `order` topic entries into [`OrderUpdate`]s.
///
/// Bybit reports cumulative execution only, so the adapter remembers the
/// last cumulative quantity and value per order to derive the size and
/// price of each individual fill.
#[derive(Default)]
pub struct OrderUpdateAdapter {
    executed: DashMap<String, (f64, f64)>,
}

impl OrderUpdateAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapt(&self, data: &OrderData) -> Option<OrderUpdate> {
        if !data.category.is_empty() && data.category != "linear" {
            return None;
        }
        let side = parse_side(&data.side)?;
        let position_side = position_side_from_idx(data.position_idx).unwrap_or_else(|| {
            // One-way mode: infer from direction
            match (side, data.reduce_only) {
                (OrderSide::Buy, false) | (OrderSide::Sell, true) => PositionSide::Long,
                (OrderSide::Sell, false) | (OrderSide::Buy, true) => PositionSide::Short,
            }
        });

        let status = parse_order_status(&data.order_status);
        let cumulative_qty = parse_f64(&data.cum_exec_qty);
        let cumulative_value = parse_f64(&data.cum_exec_value);

        let (seen_qty, seen_value) = self
            .executed
            .get(&data.order_id)
            .map(|entry| *entry.value())
            .unwrap_or((0.0, 0.0));
        let last_filled_quantity = (cumulative_qty - seen_qty).max(0.0);
        let last_filled_price = if last_filled_quantity > 0.0 {
            (cumulative_value - seen_value) / last_filled_quantity
        } else {
            0.0
        };

        if status.is_terminal() {
            self.executed.remove(&data.order_id);
        } else if cumulative_qty > 0.0 {
            self.executed
                .insert(data.order_id.clone(), (cumulative_qty, cumulative_value));
        }

        let mut average_price = parse_f64(&data.avg_price);
        if average_price <= 0.0 && cumulative_qty > 0.0 {
            average_price = cumulative_value / cumulative_qty;
        }

        Some(OrderUpdate {
            symbol: data.symbol.clone(),
            order_id: data.order_id.clone(),
            side,
            position_side,
            order_type: parse_order_type(&data.order_type, &data.stop_order_type),
            status,
            quantity: parse_f64(&data.qty),
            cumulative_filled_quantity: cumulative_qty,
            last_filled_quantity,
            average_price,
            last_filled_price,
            realized_profit: parse_f64(&data.closed_pnl),
            reduce_only: data.reduce_only,
            update_time: parse_i64(&data.updated_time),
        })
    }

    /// Orders with fills seen but not yet terminal.
    pub fn tracked_orders(&self) -> usize {
        self.executed.len()
    }
}

/// Public ticker stream plus the authenticated account stream.
pub struct BybitStreams {
    public: Arc<BybitWebSocket>,
    private: Option<Arc<BybitWebSocket>>,
    adapter: Arc<OrderUpdateAdapter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BybitStreams {
    pub fn new(public_url: String, private_url: String, auth: Option<BybitAuth>) -> Self {
        Self {
            public: Arc::new(BybitWebSocket::new(public_url)),
            private: auth.map(|auth| Arc::new(BybitWebSocket::with_auth(private_url, auth))),
            adapter: Arc::new(OrderUpdateAdapter::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the connection loops. Topics may be added before or after.
    pub fn connect(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(self.public.clone().run()));
        if let Some(private) = &self.private {
            tasks.push(tokio::spawn(private.clone().run()));
        }
        info!("✅ Bybit streams started");
    }

    /// Close both connections and wait for their loops to exit.
    pub async fn shutdown(&self) {
        self.public.close();
        if let Some(private) = &self.private {
            private.close();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl MarketStream for BybitStreams {
    async fn subscribe_ticker(&self, symbol: &str, sink: mpsc::UnboundedSender<Tick>) -> ExchangeResult<()> {
        let handler: MessageHandler = Arc::new(move |msg: &WsMessage| {
            let Some(data) = &msg.data else {
                return Ok(());
            };
            let ticker: TickerData = serde_json::from_value(data.clone())?;
            // Deltas without a price change carry no lastPrice
            if let Some(price) = ticker.last_price.as_deref().map(parse_f64).filter(|p| *p > 0.0) {
                let timestamp = msg
                    .ts
                    .map(|ts| ts as i64)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                sink.send(Tick {
                    symbol: ticker.symbol,
                    last_price: price,
                    timestamp,
                })?;
            }
            Ok(())
        });
        self.public.subscribe(ticker_topic(symbol), handler);
        Ok(())
    }

    async fn unsubscribe_ticker(&self, symbol: &str) -> ExchangeResult<()> {
        self.public.unsubscribe(&ticker_topic(symbol));
        Ok(())
    }

    async fn subscribe_account(&self, sink: mpsc::UnboundedSender<OrderUpdate>) -> ExchangeResult<()> {
        let Some(private) = &self.private else {
            return Err(ExchangeError::new(
                -1,
                "account stream requires API credentials",
                ExchangeErrorKind::Other,
            ));
        };

        let adapter = self.adapter.clone();
        let handler: MessageHandler = Arc::new(move |msg: &WsMessage| {
            let Some(data) = &msg.data else {
                return Ok(());
            };
            let orders: Vec<OrderData> = serde_json::from_value(data.clone())?;
            for order in &orders {
                match adapter.adapt(order) {
                    Some(update) => sink.send(update)?,
                    None => warn!("Skipping order event {} ({})", order.order_id, order.category),
                }
            }
            Ok(())
        });
        private.subscribe(ORDER_TOPIC.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        for topic in self.public.topics() {
            self.public.unsubscribe(&topic);
        }
        if let Some(private) = &self.private {
            for topic in private.topics() {
                private.unsubscribe(&topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderStatus, OrderType};

    fn order_event(status: &str, cum_qty: &str, cum_value: &str) -> OrderData {
        OrderData {
            category: "linear".to_string(),
            symbol: "BTCUSDT".to_string(),
            order_id: "o-1".to_string(),
            side: "Buy".to_string(),
            order_type: "Market".to_string(),
            stop_order_type: String::new(),
            order_status: status.to_string(),
            qty: "1.0".to_string(),
            cum_exec_qty: cum_qty.to_string(),
            cum_exec_value: cum_value.to_string(),
            avg_price: String::new(),
            closed_pnl: "0".to_string(),
            position_idx: 1,
            reduce_only: false,
            updated_time: "1700000000000".to_string(),
        }
    }

    #[test]
    fn test_partial_fills_are_split() {
        let adapter = OrderUpdateAdapter::new();

        let first = adapter.adapt(&order_event("PartiallyFilled", "0.25", "25000")).unwrap();
        assert_eq!(first.last_filled_quantity, 0.25);
        assert_eq!(first.last_filled_price, 100000.0);
        assert_eq!(first.average_price, 100000.0);
        assert_eq!(adapter.tracked_orders(), 1);

        let second = adapter.adapt(&order_event("Filled", "1", "100750")).unwrap();
        assert_eq!(second.last_filled_quantity, 0.75);
        assert_eq!(second.last_filled_price, 101000.0);
        assert_eq!(second.status, OrderStatus::Filled);
        assert_eq!(second.order_type, OrderType::Market);
        assert_eq!(adapter.tracked_orders(), 0);
    }

    #[test]
    fn test_one_way_side_inference() {
        let adapter = OrderUpdateAdapter::new();
        let mut event = order_event("Filled", "1", "100");
        event.position_idx = 0;
        event.side = "Buy".to_string();
        event.reduce_only = true;

        let update = adapter.adapt(&event).unwrap();
        assert_eq!(update.position_side, PositionSide::Short);
        assert!(update.is_reducing());
    }

    #[test]
    fn test_other_categories_skipped() {
        let adapter = OrderUpdateAdapter::new();
        let mut event = order_event("Filled", "1", "100");
        event.category = "spot".to_string();
        assert!(adapter.adapt(&event).is_none());
    }

    #[tokio::test]
    async fn test_account_stream_requires_credentials() {
        let streams = BybitStreams::new("wss://public.invalid".to_string(), "wss://private.invalid".to_string(), None);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(streams.subscribe_account(tx).await.is_err());
    }
}

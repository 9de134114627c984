#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use futures_position_bot::error::{ExchangeError, ExchangeErrorKind};
use futures_position_bot::exchange::{
    Balance, ExchangeClient, ExchangePosition, ExchangeResult, HistoricalOrder, Kline, MarginType, MarketStream,
    OrderAck, OrderBookSnapshot, OrderRequest, OrderSide, OrderStatus, OrderType, OrderUpdate, PositionSide,
    SymbolFilters, Ticker24h, Tick, Trade,
};
use futures_position_bot::telegram::Notifier;

pub fn filters(symbol: &str) -> SymbolFilters {
    SymbolFilters {
        symbol: symbol.to_string(),
        base_asset: symbol.trim_end_matches("USDT").to_string(),
        quote_asset: "USDT".to_string(),
        tick_size: 0.1,
        step_size: 0.001,
        min_quantity: 0.001,
        min_notional: 0.0,
        max_leverage: 50,
    }
}

pub fn exchange_position(symbol: &str, side: PositionSide, quantity: f64, entry_price: f64) -> ExchangePosition {
    ExchangePosition {
        symbol: symbol.to_string(),
        side,
        entry_price,
        quantity,
        leverage: 10,
        update_time: 1_700_000_000_000,
    }
}

/// Order update with a single fill of `last_qty` at `price`.
pub fn fill(
    symbol: &str,
    side: OrderSide,
    position_side: PositionSide,
    status: OrderStatus,
    cumulative_qty: f64,
    last_qty: f64,
    price: f64,
) -> OrderUpdate {
    OrderUpdate {
        symbol: symbol.to_string(),
        order_id: format!("{}-{}", symbol, cumulative_qty),
        side,
        position_side,
        order_type: OrderType::Market,
        status,
        quantity: cumulative_qty,
        cumulative_filled_quantity: cumulative_qty,
        last_filled_quantity: last_qty,
        average_price: price,
        last_filled_price: price,
        realized_profit: 0.0,
        reduce_only: side == position_side.closing_order_side(),
        update_time: 1_700_000_000_000,
    }
}

pub const MINUTE_MS: i64 = 60_000;

/// Closed one-minute candles ending before `now_ms`, oldest first. The
/// last volume belongs to the most recent candle. Every candle spans
/// 100..110 and closes bullish.
pub fn closed_candles(now_ms: i64, volumes: &[f64]) -> Vec<Kline> {
    let current = now_ms - now_ms % MINUTE_MS;
    let count = volumes.len() as i64;
    volumes
        .iter()
        .enumerate()
        .map(|(i, volume)| {
            let open_time = current - (count - i as i64) * MINUTE_MS;
            Kline {
                open_time,
                close_time: open_time + MINUTE_MS - 1,
                open: 101.0,
                high: 110.0,
                low: 100.0,
                close: 109.0,
                volume: *volume,
                quote_volume: volume * 105.0,
            }
        })
        .collect()
}

/// Taker buys at five prices across `kline`, heaviest at `heavy_price`.
pub fn trades_into(kline: &Kline, heavy_price: f64) -> Vec<Trade> {
    [101.0, 103.0, 105.0, 107.0, 109.0]
        .iter()
        .enumerate()
        .map(|(i, price)| Trade {
            price: *price,
            quantity: if *price == heavy_price { 50.0 } else { 5.0 },
            side: OrderSide::Buy,
            time: kline.open_time + 1_000 * (i as i64 + 1),
        })
        .collect()
}

pub fn ticker(symbol: &str, last_price: f64, quote_volume: f64) -> Ticker24h {
    Ticker24h {
        symbol: symbol.to_string(),
        last_price,
        quote_volume,
        volume: quote_volume / last_price,
    }
}

pub fn rejection(kind: ExchangeErrorKind) -> ExchangeError {
    let code = match kind {
        ExchangeErrorKind::MaxLeverageExceeded => 110090,
        ExchangeErrorKind::MinNotional => 110094,
        _ => 10001,
    };
    ExchangeError::new(code, format!("{:?}", kind), kind)
}

/// Scripted exchange recording every mutating call.
pub struct MockExchange {
    pub placed: Mutex<Vec<OrderRequest>>,
    /// Consumed one per `place_order` call before `always_reject` applies.
    pub scripted_rejections: Mutex<VecDeque<ExchangeError>>,
    pub always_reject: Mutex<Option<ExchangeError>>,
    pub place_delay: Mutex<Option<Duration>>,
    pub leverage_calls: Mutex<Vec<(String, u32)>>,
    pub margin_calls: Mutex<Vec<(String, MarginType)>>,
    pub margin_rejection: Mutex<Option<ExchangeError>>,
    pub cancelled_symbols: Mutex<Vec<String>>,
    pub orders: Mutex<Vec<HistoricalOrder>>,
    pub orders_rejection: Mutex<Option<ExchangeError>>,
    pub positions: Mutex<Vec<ExchangePosition>>,
    pub tickers: Mutex<Vec<Ticker24h>>,
    pub balance: Mutex<Balance>,
    pub filters: Mutex<Vec<SymbolFilters>>,
    pub filters_rejection: Mutex<Option<ExchangeError>>,
    pub klines: Mutex<HashMap<String, Vec<Kline>>>,
    pub trades: Mutex<HashMap<String, Vec<Trade>>>,
    /// Symbols whose kline requests fail.
    pub broken_symbols: Mutex<HashSet<String>>,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self {
            placed: Mutex::new(Vec::new()),
            scripted_rejections: Mutex::new(VecDeque::new()),
            always_reject: Mutex::new(None),
            place_delay: Mutex::new(None),
            leverage_calls: Mutex::new(Vec::new()),
            margin_calls: Mutex::new(Vec::new()),
            margin_rejection: Mutex::new(None),
            cancelled_symbols: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            orders_rejection: Mutex::new(None),
            positions: Mutex::new(Vec::new()),
            tickers: Mutex::new(Vec::new()),
            balance: Mutex::new(Balance {
                asset: "USDT".to_string(),
                wallet_balance: 1000.0,
                available_balance: 500.0,
            }),
            filters: Mutex::new(vec![filters("BTCUSDT"), filters("ETHUSDT")]),
            filters_rejection: Mutex::new(None),
            klines: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            broken_symbols: Mutex::new(HashSet::new()),
        }
    }
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn get_klines(&self, symbol: &str, _interval: u32, start: i64, end: i64) -> ExchangeResult<Vec<Kline>> {
        if self.broken_symbols.lock().contains(symbol) {
            return Err(rejection(ExchangeErrorKind::Other));
        }
        Ok(self
            .klines
            .lock()
            .get(symbol)
            .map(|klines| {
                klines
                    .iter()
                    .filter(|k| k.open_time >= start && k.open_time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_order_book(&self, symbol: &str, _limit: usize) -> ExchangeResult<OrderBookSnapshot> {
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            ..OrderBookSnapshot::default()
        })
    }

    async fn get_trades(&self, symbol: &str, start: i64, end: i64) -> ExchangeResult<Vec<Trade>> {
        Ok(self
            .trades
            .lock()
            .get(symbol)
            .map(|trades| trades.iter().filter(|t| t.time >= start && t.time <= end).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        Ok(self.tickers.lock().clone())
    }

    async fn get_symbol_filters(&self) -> ExchangeResult<Vec<SymbolFilters>> {
        if let Some(err) = self.filters_rejection.lock().clone() {
            return Err(err);
        }
        Ok(self.filters.lock().clone())
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        self.placed.lock().push(request.clone());
        let delay = *self.place_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripted_rejections.lock().pop_front();
        if let Some(err) = scripted.or_else(|| self.always_reject.lock().clone()) {
            return Err(err);
        }
        Ok(OrderAck {
            order_id: format!("order-{}", self.placed.lock().len()),
            symbol: request.symbol.clone(),
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.cancelled_symbols.lock().push(symbol.to_string());
        Ok(())
    }

    async fn get_orders(&self, symbol: &str, _limit: usize) -> ExchangeResult<Vec<HistoricalOrder>> {
        if let Some(err) = self.orders_rejection.lock().clone() {
            return Err(err);
        }
        Ok(self
            .orders
            .lock()
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        Ok(self.positions.lock().clone())
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        Ok(self.balance.lock().clone())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.leverage_calls.lock().push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType, _leverage: u32) -> ExchangeResult<()> {
        if let Some(err) = self.margin_rejection.lock().clone() {
            return Err(err);
        }
        self.margin_calls.lock().push((symbol.to_string(), margin_type));
        Ok(())
    }
}

/// Stream double: remembers subscriptions and hands out the sinks.
#[derive(Default)]
pub struct MockStream {
    pub tickers: Mutex<HashMap<String, mpsc::UnboundedSender<Tick>>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub account: Mutex<Option<mpsc::UnboundedSender<OrderUpdate>>>,
    pub reject_account: Mutex<bool>,
    pub reject_tickers: Mutex<bool>,
}

impl MockStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.tickers.lock().contains_key(symbol)
    }

    pub fn account_sink(&self) -> Option<mpsc::UnboundedSender<OrderUpdate>> {
        self.account.lock().clone()
    }

    pub fn ticker_sink(&self, symbol: &str) -> Option<mpsc::UnboundedSender<Tick>> {
        self.tickers.lock().get(symbol).cloned()
    }
}

#[async_trait]
impl MarketStream for MockStream {
    async fn subscribe_ticker(&self, symbol: &str, sink: mpsc::UnboundedSender<Tick>) -> ExchangeResult<()> {
        if *self.reject_tickers.lock() {
            return Err(ExchangeError::transport("socket closed"));
        }
        self.tickers.lock().insert(symbol.to_string(), sink);
        Ok(())
    }

    async fn unsubscribe_ticker(&self, symbol: &str) -> ExchangeResult<()> {
        self.tickers.lock().remove(symbol);
        self.unsubscribed.lock().push(symbol.to_string());
        Ok(())
    }

    async fn subscribe_account(&self, sink: mpsc::UnboundedSender<OrderUpdate>) -> ExchangeResult<()> {
        if *self.reject_account.lock() {
            return Err(rejection(ExchangeErrorKind::Other));
        }
        *self.account.lock() = Some(sink);
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        self.tickers.lock().clear();
        *self.account.lock() = None;
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_message(&self, _channel_id: &str, text: &str) -> anyhow::Result<()> {
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

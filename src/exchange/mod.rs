//! Exchange collaborator: domain types and the REST / stream seams.
//!
//! The trading core only talks to the exchange through [`ExchangeClient`]
//! and [`MarketStream`]; `crate::bybit` provides the live implementation.

pub mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::calculator;
use crate::error::ExchangeError;

pub use types::*;

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// REST surface used by the trading core. Every call is a single attempt.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Candles with `open_time` inside `[start_ms, end_ms]`, oldest first.
    /// One page; use [`fetch_klines_range`] for longer ranges.
    async fn get_klines(
        &self,
        symbol: &str,
        interval_minutes: u32,
        start_ms: i64,
        end_ms: i64,
    ) -> ExchangeResult<Vec<Kline>>;

    async fn get_order_book(&self, symbol: &str, limit: usize) -> ExchangeResult<OrderBookSnapshot>;

    /// Public trades executed inside `[start_ms, end_ms]`. Errors when the
    /// window cannot be covered in full.
    async fn get_trades(&self, symbol: &str, start_ms: i64, end_ms: i64) -> ExchangeResult<Vec<Trade>>;

    async fn get_tickers(&self) -> ExchangeResult<Vec<Ticker24h>>;

    async fn get_symbol_filters(&self) -> ExchangeResult<Vec<SymbolFilters>>;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Cancel resting (conditional included) orders on a symbol.
    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()>;

    /// Most recent orders for a symbol, newest first.
    async fn get_orders(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<HistoricalOrder>>;

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn get_balance(&self) -> ExchangeResult<Balance>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType, leverage: u32) -> ExchangeResult<()>;
}

/// Streaming surface. Deliveries are handed off through channels; the
/// account channel preserves the order the exchange sent the events in.
#[async_trait]
pub trait MarketStream: Send + Sync {
    async fn subscribe_ticker(&self, symbol: &str, sink: mpsc::UnboundedSender<Tick>) -> ExchangeResult<()>;

    async fn unsubscribe_ticker(&self, symbol: &str) -> ExchangeResult<()>;

    async fn subscribe_account(&self, sink: mpsc::UnboundedSender<OrderUpdate>) -> ExchangeResult<()>;

    async fn unsubscribe_all(&self);
}

/// Max candles the exchange returns per page.
pub const KLINE_PAGE_LIMIT: i64 = 1000;

/// Fetch candles over an arbitrary range by paging through it.
pub async fn fetch_klines_range(
    client: &dyn ExchangeClient,
    symbol: &str,
    interval_minutes: u32,
    start_ms: i64,
    end_ms: i64,
) -> ExchangeResult<Vec<Kline>> {
    let interval_ms = i64::from(interval_minutes.max(1)) * 60_000;
    let mut klines = Vec::new();

    for (from, to) in calculator::iteration_chunks(start_ms, end_ms, interval_ms * KLINE_PAGE_LIMIT) {
        let page = client.get_klines(symbol, interval_minutes, from, to).await?;
        for kline in page {
            // Page borders overlap by one candle
            if klines.last().map_or(true, |last: &Kline| kline.open_time > last.open_time) {
                klines.push(kline);
            }
        }
    }

    Ok(klines)
}

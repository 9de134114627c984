//! Keeps the position store consistent with exchange fills.
//!
//! Per (symbol, side) a position moves Absent -> Open -> (averaging) ->
//! Closing -> Absent. Order updates must be applied in the order the
//! exchange delivered them; the worker neither reorders nor deduplicates.

use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::calculator;
use crate::error::{TradeError, TradeResult};
use crate::exchange::{
    ExchangeClient, ExchangePosition, MarketStream, OrderStatus, OrderUpdate, PositionSide, Tick,
};

use super::store::{split_symbol, Position, PositionKey, PositionStore};

/// How many recent orders are scanned for the last fill price.
const ORDER_HISTORY_LIMIT: usize = 20;

/// Input for opening a tracked position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub update_time: i64,
}

impl From<&ExchangePosition> for NewPosition {
    fn from(p: &ExchangePosition) -> Self {
        Self {
            symbol: p.symbol.clone(),
            side: p.side,
            entry_price: p.entry_price,
            quantity: p.quantity,
            leverage: p.leverage,
            update_time: p.update_time,
        }
    }
}

/// What an order update did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Opened(Position),
    Averaged(Position),
    /// Partial close; the position remains.
    Reduced(Position),
    Closed {
        position: Position,
        exit_price: f64,
        realized_profit: f64,
    },
    Ignored,
}

pub struct PositionWorker {
    store: Arc<PositionStore>,
    exchange: Arc<dyn ExchangeClient>,
    streams: Arc<dyn MarketStream>,
    ticks: mpsc::UnboundedSender<Tick>,
    subscribed: DashSet<String>,
    quote_asset: String,
    default_leverage: u32,
}

impl PositionWorker {
    pub fn new(
        store: Arc<PositionStore>,
        exchange: Arc<dyn ExchangeClient>,
        streams: Arc<dyn MarketStream>,
        ticks: mpsc::UnboundedSender<Tick>,
        quote_asset: String,
        default_leverage: u32,
    ) -> Self {
        Self {
            store,
            exchange,
            streams,
            ticks,
            subscribed: DashSet::new(),
            quote_asset,
            default_leverage,
        }
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn is_ticker_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.contains(symbol)
    }

    /// Absent -> Open.
    ///
    /// Reconciled positions are taken as-is from the exchange. Positions
    /// opened by a fill additionally look up the latest filled order to
    /// seed `last_order_price`. Inconsistent input is skipped with
    /// `Ok(None)`.
    pub async fn create_position(
        &self,
        new: NewPosition,
        from_reconciliation: bool,
    ) -> TradeResult<Option<Position>> {
        if new.quantity <= 0.0 || new.entry_price <= 0.0 {
            warn!(
                "⚠️  Skipping {} {}: inconsistent data (qty {}, entry {})",
                new.symbol, new.side, new.quantity, new.entry_price
            );
            return Ok(None);
        }

        let last_order_price = if from_reconciliation {
            new.entry_price
        } else {
            self.last_filled_price(&new.symbol, new.side)
                .await?
                .unwrap_or(new.entry_price)
        };

        let (base_asset, quote_asset) = split_symbol(&new.symbol, &self.quote_asset);
        let position = Position {
            symbol: new.symbol.clone(),
            base_asset,
            quote_asset,
            side: new.side,
            entry_price: new.entry_price,
            total_quantity: new.quantity,
            leverage: if new.leverage > 0 { new.leverage } else { self.default_leverage },
            last_order_price,
            update_time: new.update_time,
        };

        // Stop timers of reconciled positions keep running across restarts
        let opened_at = if from_reconciliation && new.update_time > 0 {
            new.update_time
        } else {
            chrono::Utc::now().timestamp_millis()
        };

        if let Err(e) = self.store.add(position.clone(), opened_at) {
            error!("🔥 CRITICAL | {}", e);
            return Err(e.into());
        }

        if let Err(e) = self.ensure_ticker(&new.symbol).await {
            error!("❌ Ticker subscription for {} failed: {}", new.symbol, e);
            self.store.remove(&position.key());
            return Err(e);
        }

        info!(
            "📍 Position tracked: {} {} | qty {} @ {} | {}x{}",
            position.symbol,
            position.side,
            position.total_quantity,
            position.entry_price,
            position.leverage,
            if from_reconciliation { " (reconciled)" } else { "" }
        );

        Ok(Some(position))
    }

    /// Averaging-loop self transition: add or withdraw the filled quantity.
    /// Never changes store membership.
    pub fn update_position_quantity(
        &self,
        key: &PositionKey,
        update: &OrderUpdate,
        is_withdraw: bool,
    ) -> Option<Position> {
        let fill_quantity = update.last_filled_quantity;
        let fill_price = if update.last_filled_price > 0.0 {
            update.last_filled_price
        } else {
            update.average_price
        };

        let updated = self.store.update(key, |position| {
            if is_withdraw {
                let remaining = position.total_quantity - fill_quantity;
                position.total_quantity = if calculator::is_zero_quantity(remaining) || remaining < 0.0 {
                    0.0
                } else {
                    remaining
                };
            } else {
                position.entry_price = calculator::weighted_entry_price(
                    position.total_quantity,
                    position.entry_price,
                    fill_quantity,
                    fill_price,
                );
                position.total_quantity += fill_quantity;
            }
            position.last_order_price = fill_price;
            position.update_time = update.update_time;
        })?;

        if let Some(info) = self.store.info(key) {
            if !is_withdraw {
                info.rearm_stops();
            }
            // Adds always, reductions only while something remains
            if (!is_withdraw || !calculator::is_zero_quantity(updated.total_quantity)) && info.reopen_checks() {
                info!("{} changed while closing, checks resume at qty {}", key, updated.total_quantity);
            }
        }

        debug!(
            "{} qty {} {} -> {}",
            key,
            if is_withdraw { "-" } else { "+" },
            fill_quantity,
            updated.total_quantity
        );
        Some(updated)
    }

    /// -> Absent. The ticker stream is released only when no position on
    /// the symbol remains.
    pub async fn delete_position(&self, key: &PositionKey) -> Option<Position> {
        let removed = self.store.remove(key)?;

        if !self.store.has_symbol(&key.symbol) {
            self.release_ticker(&key.symbol).await;
        }

        info!("🔒 Position removed: {}", key);
        Some(removed)
    }

    /// Apply one account-stream order event.
    pub async fn apply_order_update(&self, update: &OrderUpdate) -> TradeResult<PositionEvent> {
        if !update.has_fill() {
            return Ok(PositionEvent::Ignored);
        }

        let key = PositionKey::new(update.symbol.clone(), update.position_side);
        let is_withdraw = update.is_reducing();

        match (self.store.contains(&key), is_withdraw) {
            (false, false) => {
                if update.status != OrderStatus::Filled {
                    debug!("{}: partial fill before position exists, waiting for Filled", key);
                    return Ok(PositionEvent::Ignored);
                }
                let new = NewPosition {
                    symbol: update.symbol.clone(),
                    side: update.position_side,
                    entry_price: update.average_price,
                    quantity: update.cumulative_filled_quantity,
                    leverage: self.default_leverage,
                    update_time: update.update_time,
                };
                Ok(match self.create_position(new, false).await? {
                    Some(position) => PositionEvent::Opened(position),
                    None => PositionEvent::Ignored,
                })
            }
            (true, false) => Ok(self
                .update_position_quantity(&key, update, false)
                .map_or(PositionEvent::Ignored, PositionEvent::Averaged)),
            (true, true) => {
                let Some(updated) = self.update_position_quantity(&key, update, true) else {
                    return Ok(PositionEvent::Ignored);
                };
                if !calculator::is_zero_quantity(updated.total_quantity) {
                    return Ok(PositionEvent::Reduced(updated));
                }
                self.delete_position(&key).await;
                Ok(PositionEvent::Closed {
                    position: updated,
                    exit_price: update.average_price,
                    realized_profit: update.realized_profit,
                })
            }
            (false, true) => {
                warn!("⚠️  Closing fill for untracked position {}", key);
                Ok(PositionEvent::Ignored)
            }
        }
    }

    /// Startup sweep: track every exchange position not yet in the store.
    /// One entry failing never aborts the rest. Returns how many were added.
    pub async fn reconcile(&self, positions: &[ExchangePosition]) -> usize {
        let mut added = 0;
        for exchange_position in positions {
            let key = PositionKey::new(exchange_position.symbol.clone(), exchange_position.side);
            if self.store.contains(&key) {
                continue;
            }
            match self.create_position(exchange_position.into(), true).await {
                Ok(Some(_)) => added += 1,
                Ok(None) => {}
                Err(e) => error!("❌ Reconciliation of {} failed: {}", key, e),
            }
        }
        added
    }

    /// Unsubscribe every ticker this worker holds.
    pub async fn release_all(&self) {
        let symbols: Vec<String> = self.subscribed.iter().map(|s| s.clone()).collect();
        for symbol in symbols {
            self.release_ticker(&symbol).await;
        }
    }

    async fn last_filled_price(&self, symbol: &str, side: PositionSide) -> TradeResult<Option<f64>> {
        let orders = self
            .exchange
            .get_orders(symbol, ORDER_HISTORY_LIMIT)
            .await
            .map_err(|e| {
                warn!("❌ Order history for {} unavailable: {}", symbol, e);
                TradeError::Client(e)
            })?;

        Ok(orders
            .iter()
            .filter(|o| o.status == OrderStatus::Filled && o.average_price > 0.0)
            .find(|o| match o.position_side {
                Some(position_side) => position_side == side,
                None => o.side == side.opening_order_side(),
            })
            .map(|o| o.average_price))
    }

    async fn ensure_ticker(&self, symbol: &str) -> TradeResult<()> {
        if !self.subscribed.insert(symbol.to_string()) {
            return Ok(());
        }
        if let Err(e) = self.streams.subscribe_ticker(symbol, self.ticks.clone()).await {
            self.subscribed.remove(symbol);
            return Err(e.into());
        }
        debug!("Ticker subscribed: {}", symbol);
        Ok(())
    }

    async fn release_ticker(&self, symbol: &str) {
        if self.subscribed.remove(symbol).is_none() {
            return;
        }
        match self.streams.unsubscribe_ticker(symbol).await {
            Ok(()) => debug!("Ticker unsubscribed: {}", symbol),
            Err(e) => warn!("Ticker unsubscribe for {} failed: {}", symbol, e),
        }
    }
}

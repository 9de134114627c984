//! Order endpoints: order placement wrapped in a bounded retry loop.
//!
//! Every attempt sizes a fresh quantity, so a retry after a response that
//! was lost but accepted by the exchange can leave an extra small order.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calculator;
use crate::config::RetryOptions;
use crate::error::{ExchangeError, ExchangeErrorKind, TradeError, TradeResult};
use crate::exchange::{ExchangeClient, OrderAck, OrderKind, OrderRequest, PositionSide, SymbolFilters};
use crate::position::Position;

/// A placed order and the sizing that finally went through.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub ack: OrderAck,
    pub quantity: f64,
    pub leverage: u32,
    pub attempts: u32,
}

pub struct OrderEndpoints {
    exchange: Arc<dyn ExchangeClient>,
    retry: RetryOptions,
}

impl OrderEndpoints {
    pub fn new(exchange: Arc<dyn ExchangeClient>, retry: RetryOptions) -> Self {
        Self { exchange, retry }
    }

    /// Market order opening `side` with `margin` of quote currency.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_open_order(
        &self,
        symbol: &str,
        side: PositionSide,
        price: f64,
        margin: f64,
        leverage: u32,
        filters: &SymbolFilters,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        self.place_sized("open", symbol, side, price, margin, leverage, filters, cancel)
            .await
    }

    /// Market order adding to an existing position.
    pub async fn place_average_order(
        &self,
        position: &Position,
        price: f64,
        margin: f64,
        filters: &SymbolFilters,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        self.place_sized(
            "average",
            &position.symbol,
            position.side,
            price,
            margin,
            position.leverage,
            filters,
            cancel,
        )
        .await
    }

    /// Reduce-only market order for the whole position.
    pub async fn place_close_order(
        &self,
        position: &Position,
        filters: &SymbolFilters,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.closing_order_side(),
            position_side: position.side,
            kind: OrderKind::Market,
            quantity: close_quantity(position.total_quantity, filters.step_size),
            reduce_only: true,
        };
        self.place_fixed("close", request, position.leverage, cancel).await
    }

    /// Reduce-only conditional order protecting the whole position.
    /// Prices are rounded to the symbol's tick size.
    pub async fn place_stop_order(
        &self,
        position: &Position,
        kind: OrderKind,
        filters: &SymbolFilters,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        let kind = match kind {
            OrderKind::StopMarket { trigger_price } => OrderKind::StopMarket {
                trigger_price: calculator::round_to_tick(trigger_price, filters.tick_size),
            },
            OrderKind::TrailingStop {
                activation_price,
                callback_rate,
            } => OrderKind::TrailingStop {
                activation_price: calculator::round_to_tick(activation_price, filters.tick_size),
                callback_rate,
            },
            OrderKind::Market => OrderKind::Market,
        };
        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: position.side.closing_order_side(),
            position_side: position.side,
            kind,
            quantity: close_quantity(position.total_quantity, filters.step_size),
            reduce_only: true,
        };
        self.place_fixed("stop", request, position.leverage, cancel).await
    }

    /// Retry loop for margin-sized market orders. Max-leverage rejections
    /// lower leverage, min-notional rejections grow the margin basis.
    #[allow(clippy::too_many_arguments)]
    async fn place_sized(
        &self,
        label: &'static str,
        symbol: &str,
        side: PositionSide,
        price: f64,
        margin: f64,
        leverage: u32,
        filters: &SymbolFilters,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        let max_attempts = self.retry.max_attempts.max(1);
        let margin_step = margin * self.retry.margin_step_percent / 100.0;
        let mut margin = margin;
        let mut leverage = leverage.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let Some(quantity) = calculator::order_quantity(margin, leverage, price, filters) else {
                debug!(
                    "{} {} attempt {}: margin {:.4} below exchange minimum",
                    label, symbol, attempt, margin
                );
                margin += margin_step;
                last_error = Some(ExchangeError::new(
                    -1,
                    "order quantity below exchange minimum",
                    ExchangeErrorKind::MinNotional,
                ));
                continue;
            };

            let request = OrderRequest {
                symbol: symbol.to_string(),
                side: side.opening_order_side(),
                position_side: side,
                kind: OrderKind::Market,
                quantity,
                reduce_only: false,
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("{} order for {} cancelled", label, symbol);
                    return Err(TradeError::Cancelled);
                }
                outcome = self.exchange.place_order(&request) => outcome,
            };

            match outcome {
                Ok(ack) => {
                    info!(
                        "✅ {} {} {} | qty {} @ ~{} | {}x | attempt {}",
                        label, symbol, side, quantity, price, leverage, attempt
                    );
                    return Ok(PlacedOrder {
                        ack,
                        quantity,
                        leverage,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is(ExchangeErrorKind::MaxLeverageExceeded) => {
                    let lowered = leverage.saturating_sub(self.retry.leverage_step.max(1)).max(1);
                    warn!(
                        "⚠️  {} {} attempt {}: {} | leverage {}x -> {}x",
                        label, symbol, attempt, e, leverage, lowered
                    );
                    if lowered != leverage {
                        match self.exchange.set_leverage(symbol, lowered).await {
                            Ok(()) => leverage = lowered,
                            Err(set_err) => warn!("Leverage change for {} failed: {}", symbol, set_err),
                        }
                    }
                    last_error = Some(e);
                }
                Err(e) if e.is(ExchangeErrorKind::MinNotional) => {
                    margin += margin_step;
                    warn!(
                        "⚠️  {} {} attempt {}: {} | margin -> {:.4}",
                        label, symbol, attempt, e, margin
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!("⚠️  {} {} attempt {}: {}", label, symbol, attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ExchangeError::new(-1, "no attempt made", ExchangeErrorKind::Other));
        error!(
            "❌ {} order for {} failed after {} attempts: {}",
            label, symbol, max_attempts, err
        );
        Err(TradeError::Client(err))
    }

    /// Retry loop for orders whose size is fixed by the position.
    async fn place_fixed(
        &self,
        label: &'static str,
        request: OrderRequest,
        leverage: u32,
        cancel: &CancellationToken,
    ) -> TradeResult<PlacedOrder> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("{} order for {} cancelled", label, request.symbol);
                    return Err(TradeError::Cancelled);
                }
                outcome = self.exchange.place_order(&request) => outcome,
            };

            match outcome {
                Ok(ack) => {
                    info!(
                        "✅ {} {} {} | qty {} | attempt {}",
                        label, request.symbol, request.position_side, request.quantity, attempt
                    );
                    return Ok(PlacedOrder {
                        ack,
                        quantity: request.quantity,
                        leverage,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!("⚠️  {} {} attempt {}: {}", label, request.symbol, attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ExchangeError::new(-1, "no attempt made", ExchangeErrorKind::Other));
        error!(
            "❌ {} order for {} failed after {} attempts: {}",
            label, request.symbol, max_attempts, err
        );
        Err(TradeError::Client(err))
    }
}

/// Position quantity snapped to the lot step, never rounded away to zero.
fn close_quantity(quantity: f64, step: f64) -> f64 {
    let snapped = calculator::round_to_tick(quantity, step);
    if calculator::is_zero_quantity(snapped) {
        quantity
    } else {
        snapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_quantity_snaps_to_step() {
        assert_eq!(close_quantity(0.30000000000000004, 0.001), 0.3);
        assert_eq!(close_quantity(0.0004, 0.001), 0.0004);
        assert_eq!(close_quantity(2.0, 0.0), 2.0);
    }
}

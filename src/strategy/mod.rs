//! Trade logic: strategy variants over a shared trading core.

pub mod context;
pub mod percent_limit;
pub mod percent_move;
pub mod runner;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{StrategyConfig, TradeLogicKind, TradeLogicOptions};
use crate::error::TradeResult;
use crate::exchange::{ExchangeClient, MarketStream, Tick};
use crate::position::Position;
use crate::telegram::{CycleSummary, Notifications};

pub use context::TradeLogicContext;
pub use percent_limit::PercentLimitLogic;
pub use percent_move::PercentMoveLogic;
pub use runner::{RunnerState, StrategyRunner};

/// One running strategy. An instance is started once and finished once.
#[async_trait]
pub trait TradeLogic: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> &TradeLogicOptions;

    /// Reconcile with the exchange and start listening. On error the
    /// caller must still call [`TradeLogic::finish`].
    async fn init(&self) -> TradeResult<()>;

    /// One evaluation cycle: scan, open, average.
    async fn run_instance(&self, cancel: CancellationToken) -> TradeResult<CycleSummary>;

    /// Exit checks for the positions on the ticked symbol.
    async fn check_current_positions(&self, tick: Tick) -> TradeResult<()>;

    /// Ticker stream of the tracked symbols, to be fed back into
    /// [`TradeLogic::check_current_positions`]. Yields `Some` once.
    fn take_ticks(&self) -> Option<mpsc::UnboundedReceiver<Tick>>;

    /// Tear down tracking. Positions are never closed here; unforced
    /// finishes also cancel resting stop orders.
    async fn finish(&self, is_forced: bool) -> TradeResult<()>;

    fn positions(&self) -> Vec<Position>;
}

/// Build the variant named by `strategy.kind`.
pub fn create_trade_logic(
    strategy: &StrategyConfig,
    exchange: Arc<dyn ExchangeClient>,
    streams: Arc<dyn MarketStream>,
    notifications: Notifications,
) -> Arc<dyn TradeLogic> {
    let context = TradeLogicContext::new(
        strategy.name.clone(),
        Arc::new(strategy.options.clone()),
        exchange,
        streams,
        notifications,
    );
    match strategy.kind {
        TradeLogicKind::PercentLimit => Arc::new(PercentLimitLogic::new(context)),
        TradeLogicKind::PercentMove => Arc::new(PercentMoveLogic::new(context)),
    }
}

//! Like the percent-limit variant, but each averaging also waits for
//! price to move `average_percent_move` against the position since the
//! last fill.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TradeLogicOptions;
use crate::error::TradeResult;
use crate::exchange::Tick;
use crate::filters;
use crate::position::Position;
use crate::telegram::CycleSummary;

use super::{TradeLogic, TradeLogicContext};

pub struct PercentMoveLogic {
    context: Arc<TradeLogicContext>,
}

impl PercentMoveLogic {
    pub fn new(context: Arc<TradeLogicContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<TradeLogicContext> {
        &self.context
    }
}

#[async_trait]
impl TradeLogic for PercentMoveLogic {
    fn name(&self) -> &str {
        self.context.name()
    }

    fn options(&self) -> &TradeLogicOptions {
        self.context.options()
    }

    async fn init(&self) -> TradeResult<()> {
        self.context.init().await
    }

    async fn run_instance(&self, cancel: CancellationToken) -> TradeResult<CycleSummary> {
        self.context
            .run_cycle(cancel, filters::is_need_to_place_percent_move_average)
            .await
    }

    async fn check_current_positions(&self, tick: Tick) -> TradeResult<()> {
        self.context.check_tick(&tick).await
    }

    fn take_ticks(&self) -> Option<mpsc::UnboundedReceiver<Tick>> {
        self.context.take_ticks()
    }

    async fn finish(&self, is_forced: bool) -> TradeResult<()> {
        self.context.finish(is_forced).await
    }

    fn positions(&self) -> Vec<Position> {
        self.context.store().all()
    }
}

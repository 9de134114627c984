//! Averages whenever ROE sits inside the configured band and the latest
//! signal agrees with the position.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::TradeLogicOptions;
use crate::error::TradeResult;
use crate::exchange::Tick;
use crate::filters;
use crate::position::Position;
use crate::signal::Signal;
use crate::telegram::CycleSummary;

use super::{TradeLogic, TradeLogicContext};

pub struct PercentLimitLogic {
    context: Arc<TradeLogicContext>,
}

impl PercentLimitLogic {
    pub fn new(context: Arc<TradeLogicContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<TradeLogicContext> {
        &self.context
    }

    fn should_average(
        position: &Position,
        _price: f64,
        roe: f64,
        signal: Option<&Signal>,
        options: &TradeLogicOptions,
    ) -> bool {
        filters::is_need_to_place_average_order(position, roe, signal, options)
    }
}

#[async_trait]
impl TradeLogic for PercentLimitLogic {
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
        self.context.run_cycle(cancel, Self::should_average).await
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

//! Strategy lifecycle: Idle -> Initializing -> Running -> Stopping -> Idle.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TradeError, TradeResult};
use crate::exchange::Tick;
use crate::position::Position;

use super::TradeLogic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Initializing,
    Running,
    Stopping,
}

struct Running {
    logic: Arc<dyn TradeLogic>,
    cancel: CancellationToken,
    cycle_task: JoinHandle<()>,
    tick_task: Option<JoinHandle<()>>,
}

/// Drives one trade logic at a time. Evaluation cycles never overlap.
pub struct StrategyRunner {
    state: Mutex<RunnerState>,
    running: Mutex<Option<Running>>,
}

impl Default for StrategyRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunnerState::Idle),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    /// Open positions of the running strategy.
    pub fn positions(&self) -> Vec<Position> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.logic.positions())
            .unwrap_or_default()
    }

    /// Initialize `logic` and schedule its cycles. A failed init is rolled
    /// back with a forced finish and leaves the runner idle.
    pub async fn start(&self, logic: Arc<dyn TradeLogic>) -> TradeResult<()> {
        {
            let mut state = self.state.lock();
            if *state != RunnerState::Idle {
                return Err(TradeError::system(format!("runner is {:?}", *state)));
            }
            *state = RunnerState::Initializing;
        }

        if let Err(e) = logic.init().await {
            error!("❌ {} failed to initialize: {}", logic.name(), e);
            if let Err(finish_err) = logic.finish(true).await {
                warn!("Rollback of {} incomplete: {}", logic.name(), finish_err);
            }
            *self.state.lock() = RunnerState::Idle;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let interval = Duration::from_secs(logic.options().instance_interval_secs.max(1));
        let cycle_task = tokio::spawn(run_cycles(logic.clone(), interval, cancel.clone()));
        let tick_task = match logic.take_ticks() {
            Some(ticks) => Some(tokio::spawn(dispatch_ticks(logic.clone(), ticks, cancel.clone()))),
            None => {
                warn!("{} has no tick stream, exit checks disabled", logic.name());
                None
            }
        };

        *self.running.lock() = Some(Running {
            logic,
            cancel,
            cycle_task,
            tick_task,
        });
        *self.state.lock() = RunnerState::Running;
        Ok(())
    }

    /// Stop the cycles and finish the logic. Forced stops leave resting
    /// orders in place.
    pub async fn stop(&self, is_forced: bool) -> TradeResult<()> {
        {
            let mut state = self.state.lock();
            if *state != RunnerState::Running {
                return Err(TradeError::system(format!("runner is {:?}", *state)));
            }
            *state = RunnerState::Stopping;
        }

        let Some(running) = self.running.lock().take() else {
            *self.state.lock() = RunnerState::Idle;
            return Ok(());
        };

        running.cancel.cancel();
        if let Err(e) = running.cycle_task.await {
            error!("🔥 CRITICAL | cycle task failed: {}", e);
        }
        if let Some(tick_task) = running.tick_task {
            if let Err(e) = tick_task.await {
                error!("🔥 CRITICAL | tick dispatcher failed: {}", e);
            }
        }

        let result = running.logic.finish(is_forced).await;
        *self.state.lock() = RunnerState::Idle;
        info!("👋 {} stopped", running.logic.name());
        result
    }
}

/// Ticks for different symbols are checked concurrently, one task each.
async fn dispatch_ticks(
    logic: Arc<dyn TradeLogic>,
    mut ticks: mpsc::UnboundedReceiver<Tick>,
    cancel: CancellationToken,
) {
    loop {
        let tick = tokio::select! {
            _ = cancel.cancelled() => break,
            tick = ticks.recv() => match tick {
                Some(tick) => tick,
                None => break,
            },
        };
        let logic = Arc::clone(&logic);
        tokio::spawn(async move {
            let symbol = tick.symbol.clone();
            if let Err(e) = logic.check_current_positions(tick).await {
                warn!("⚠️  Tick check for {} failed: {}", symbol, e);
            }
        });
    }
    debug!("Tick dispatcher stopped");
}

async fn run_cycles(logic: Arc<dyn TradeLogic>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match logic.run_instance(cancel.child_token()).await {
            Ok(summary) => debug!("{} cycle done: {:?}", logic.name(), summary),
            Err(TradeError::Cancelled) => {
                warn!("{} cycle cancelled", logic.name());
                break;
            }
            Err(e) => warn!("⚠️  {} cycle failed: {}", logic.name(), e),
        }
    }
}

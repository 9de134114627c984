//! Behaviour shared by every strategy variant: reconciliation, the
//! account-update writer, per-tick exit checks and the evaluation cycle.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calculator;
use crate::config::TradeLogicOptions;
use crate::error::{TradeError, TradeResult};
use crate::exchange::{
    Balance, ExchangeClient, ExchangePosition, MarketStream, OrderKind, OrderUpdate, PositionSide, SymbolFilters,
    Tick,
};
use crate::execution::OrderEndpoints;
use crate::filters::{self, ExitAction, ExitContext};
use crate::position::{Position, PositionEvent, PositionKey, PositionStore, PositionWorker};
use crate::signal::{scanner, InstanceResult, Signal};
use crate::telegram::{self, CycleSummary, Notifications};

/// Averaging decision of a variant: (position, price, roe, latest signal, options).
pub type AveragingRule = fn(&Position, f64, f64, Option<&Signal>, &TradeLogicOptions) -> bool;

pub struct TradeLogicContext {
    name: String,
    options: Arc<TradeLogicOptions>,
    exchange: Arc<dyn ExchangeClient>,
    streams: Arc<dyn MarketStream>,
    store: Arc<PositionStore>,
    worker: Arc<PositionWorker>,
    endpoints: OrderEndpoints,
    notifications: Notifications,
    symbol_filters: DashMap<String, SymbolFilters>,
    latest_signals: DashMap<String, Signal>,
    /// Available balance percent as f64 bits; read by tick checks.
    available_balance_percent: AtomicU64,
    ticks: Mutex<Option<mpsc::UnboundedReceiver<Tick>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl TradeLogicContext {
    pub fn new(
        name: String,
        options: Arc<TradeLogicOptions>,
        exchange: Arc<dyn ExchangeClient>,
        streams: Arc<dyn MarketStream>,
        notifications: Notifications,
    ) -> Arc<Self> {
        let store = Arc::new(PositionStore::new());
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(PositionWorker::new(
            store.clone(),
            exchange.clone(),
            streams.clone(),
            tick_tx,
            options.quote_asset.clone(),
            options.leverage,
        ));

        Arc::new(Self {
            name,
            endpoints: OrderEndpoints::new(exchange.clone(), options.retry),
            options,
            exchange,
            streams,
            store,
            worker,
            notifications,
            symbol_filters: DashMap::new(),
            latest_signals: DashMap::new(),
            available_balance_percent: AtomicU64::new(100f64.to_bits()),
            ticks: Mutex::new(Some(tick_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TradeLogicOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn worker(&self) -> &Arc<PositionWorker> {
        &self.worker
    }

    pub fn latest_signal(&self, symbol: &str) -> Option<Signal> {
        self.latest_signals.get(symbol).map(|s| s.clone())
    }

    pub fn available_balance_percent(&self) -> f64 {
        f64::from_bits(self.available_balance_percent.load(Ordering::Acquire))
    }

    fn set_available_balance_percent(&self, percent: f64) {
        self.available_balance_percent.store(percent.to_bits(), Ordering::Release);
    }

    /// Initializing: filters, exchange settings, reconciliation, streams.
    /// Any failing required step aborts with its error.
    pub async fn init(self: &Arc<Self>) -> TradeResult<()> {
        info!("🚀 Initializing strategy {}", self.name);

        self.refresh_symbol_filters().await?;

        let positions = self.exchange.get_positions().await.map_err(|e| {
            error!("❌ Could not load exchange positions: {}", e);
            TradeError::Client(e)
        })?;

        self.apply_exchange_settings(&positions).await?;

        let reconciled = self.worker.reconcile(&positions).await;
        info!("📂 Reconciled {} of {} exchange positions", reconciled, positions.len());

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        self.streams.subscribe_account(update_tx).await.map_err(|e| {
            error!("❌ Account stream subscription failed: {}", e);
            TradeError::Client(e)
        })?;
        self.spawn_account_writer(update_rx);

        if let Err(e) = self.refresh_balance().await {
            warn!("Balance unavailable at start: {}", e);
        }

        self.notifications
            .publish(telegram::format_startup(&self.name, self.store.len()));
        info!("✅ Strategy {} running with {} positions", self.name, self.store.len());
        Ok(())
    }

    /// Margin type and leverage must be settable on every open position.
    async fn apply_exchange_settings(&self, positions: &[ExchangePosition]) -> TradeResult<()> {
        let mut seen = HashSet::new();
        for position in positions {
            if !seen.insert(position.symbol.as_str()) {
                continue;
            }
            let leverage = if position.leverage > 0 { position.leverage } else { self.options.leverage };

            self.exchange
                .set_margin_type(&position.symbol, self.options.margin_type, leverage)
                .await
                .map_err(|e| {
                    error!("❌ Margin type for {} failed: {}", position.symbol, e);
                    TradeError::Client(e)
                })?;
            self.exchange
                .set_leverage(&position.symbol, leverage)
                .await
                .map_err(|e| {
                    error!("❌ Leverage for {} failed: {}", position.symbol, e);
                    TradeError::Client(e)
                })?;
        }
        Ok(())
    }

    /// Single writer: order updates are applied one at a time, in
    /// delivery order.
    fn spawn_account_writer(self: &Arc<Self>, mut updates: mpsc::UnboundedReceiver<OrderUpdate>) {
        let context = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = context.shutdown.cancelled() => break,
                    update = updates.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                };
                context.handle_order_update(&update).await;
            }
            debug!("Account writer stopped");
        });
        self.tasks.lock().push(handle);
    }

    async fn handle_order_update(&self, update: &OrderUpdate) {
        match self.worker.apply_order_update(update).await {
            Ok(PositionEvent::Opened(position)) => {
                self.notifications.publish(telegram::format_position_opened(&position));
            }
            Ok(PositionEvent::Averaged(position)) => {
                self.notifications.publish(telegram::format_position_averaged(&position));
            }
            Ok(PositionEvent::Closed {
                position,
                exit_price,
                realized_profit,
            }) => {
                info!(
                    "🔒 {} {} closed @ {} | PnL {:.4}",
                    position.symbol, position.side, exit_price, realized_profit
                );
                self.notifications
                    .publish(telegram::format_position_closed(&position, exit_price, realized_profit));
            }
            Ok(PositionEvent::Reduced(position)) => {
                info!("{} {} reduced to {}", position.symbol, position.side, position.total_quantity);
            }
            Ok(PositionEvent::Ignored) => {}
            Err(e) => error!("❌ Order update {} on {} not applied: {}", update.order_id, update.symbol, e),
        }
    }

    /// Ticker updates of every tracked symbol. Taken once, by whoever
    /// drives the exit checks.
    pub fn take_ticks(&self) -> Option<mpsc::UnboundedReceiver<Tick>> {
        self.ticks.lock().take()
    }

    /// Exit checks for both sides of the ticked symbol. A side whose check
    /// slot is taken is skipped for this tick.
    pub async fn check_tick(&self, tick: &Tick) -> TradeResult<()> {
        for side in PositionSide::BOTH {
            let key = PositionKey::new(tick.symbol.clone(), side);
            let Some(info) = self.store.info(&key) else {
                continue;
            };
            let Some(guard) = info.try_begin_check() else {
                debug!("{} check in flight, tick dropped", key);
                continue;
            };
            let Some(position) = self.store.find(&key) else {
                continue;
            };

            let context = ExitContext {
                price: tick.last_price,
                now_ms: chrono::Utc::now().timestamp_millis(),
                available_balance_percent: self.available_balance_percent(),
            };

            match filters::exit_action(&position, &info, &context, &self.options) {
                ExitAction::None => {}
                ExitAction::MarketClose { reason } => {
                    info!("🔄 Closing {} at {} ({:?})", key, tick.last_price, reason);
                    let filters = self.symbol_filters(&key.symbol).await?;
                    match self
                        .endpoints
                        .place_close_order(&position, &filters, &self.shutdown)
                        .await
                    {
                        // Closing: no further checks until the fill removes it
                        Ok(_) => guard.hold(),
                        Err(e) => self.report_failure(&position, "close", &e),
                    }
                }
                ExitAction::PlaceTrailingStop {
                    activation_price,
                    callback_rate,
                } => {
                    let filters = self.symbol_filters(&key.symbol).await?;
                    let kind = OrderKind::TrailingStop {
                        activation_price,
                        callback_rate,
                    };
                    match self
                        .endpoints
                        .place_stop_order(&position, kind, &filters, &self.shutdown)
                        .await
                    {
                        Ok(_) => {
                            info!("🛡️  Trailing stop set for {} from {}", key, activation_price);
                            info.set_needs_trailing_stop(false);
                        }
                        Err(e) => self.report_failure(&position, "trailing stop", &e),
                    }
                }
                ExitAction::PlaceMarketStop { trigger_price } => {
                    let filters = self.symbol_filters(&key.symbol).await?;
                    let kind = OrderKind::StopMarket { trigger_price };
                    match self
                        .endpoints
                        .place_stop_order(&position, kind, &filters, &self.shutdown)
                        .await
                    {
                        Ok(_) => {
                            info!("🛡️  Market stop set for {} @ {}", key, trigger_price);
                            info.set_needs_market_stop(false);
                        }
                        Err(e) => self.report_failure(&position, "market stop", &e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Running: one evaluation cycle with the variant's averaging rule.
    pub async fn run_cycle(&self, cancel: CancellationToken, should_average: AveragingRule) -> TradeResult<CycleSummary> {
        let balance = self.refresh_balance().await?;

        let tickers = self.exchange.get_tickers().await?;
        let prices: HashMap<String, f64> = tickers.iter().map(|t| (t.symbol.clone(), t.last_price)).collect();
        let universe: Vec<_> = tickers
            .into_iter()
            .filter(|t| self.options.accepts_symbol(&t.symbol))
            .collect();

        let results = scanner::scan_universe(
            self.exchange.clone(),
            universe,
            self.options.clone(),
            cancel.clone(),
        )
        .await?;
        for result in &results {
            self.latest_signals.insert(result.symbol.clone(), result.signal.clone());
        }

        let mut summary = CycleSummary {
            evaluated: results.len(),
            available_balance_percent: balance.available_percent(),
            ..CycleSummary::default()
        };

        self.open_positions(&results, &balance, &cancel, &mut summary).await?;
        self.average_positions(&results, &prices, &balance, &cancel, should_average, &mut summary)
            .await?;

        summary.open_positions = self.store.len();
        info!(
            "📊 {} cycle | evaluated {} | candidates {} | opened {} | averaged {} | failed {}",
            self.name, summary.evaluated, summary.candidates, summary.opened, summary.averaged, summary.failed
        );
        if self.options.notify_summary {
            self.notifications
                .publish(telegram::format_cycle_summary(&self.name, &summary));
        }
        Ok(summary)
    }

    async fn open_positions(
        &self,
        results: &[InstanceResult],
        balance: &Balance,
        cancel: &CancellationToken,
        summary: &mut CycleSummary,
    ) -> TradeResult<()> {
        let exchange_count = match self.exchange.get_positions().await {
            Ok(positions) => positions.len(),
            Err(e) => {
                warn!("Exchange position count unavailable: {}", e);
                0
            }
        };

        let candidates = filters::open_candidates(results, &self.store, exchange_count, &self.options);
        summary.candidates = candidates.len();

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(TradeError::Cancelled);
            }
            info!(
                "🎯 Opening {} {} @ ~{} (strong: {})",
                candidate.symbol, candidate.side, candidate.last_price, candidate.strong
            );

            let filters = match self.symbol_filters(&candidate.symbol).await {
                Ok(filters) => filters,
                Err(e) => {
                    warn!("⚠️  {} skipped: {}", candidate.symbol, e);
                    summary.failed += 1;
                    continue;
                }
            };
            let margin = calculator::margin_from_percent(balance.available_balance, self.options.margin_percent);

            match self
                .endpoints
                .place_open_order(
                    &candidate.symbol,
                    candidate.side,
                    candidate.last_price,
                    margin,
                    self.options.leverage,
                    &filters,
                    cancel,
                )
                .await
            {
                Ok(_) => summary.opened += 1,
                Err(TradeError::Cancelled) => return Err(TradeError::Cancelled),
                Err(e) => {
                    summary.failed += 1;
                    self.notifications.publish(telegram::format_order_failed(
                        &candidate.symbol,
                        candidate.side,
                        "open",
                        &e.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn average_positions(
        &self,
        results: &[InstanceResult],
        prices: &HashMap<String, f64>,
        balance: &Balance,
        cancel: &CancellationToken,
        should_average: AveragingRule,
        summary: &mut CycleSummary,
    ) -> TradeResult<()> {
        let by_symbol: HashMap<&str, &InstanceResult> = results.iter().map(|r| (r.symbol.as_str(), r)).collect();

        for position in self.store.all() {
            if cancel.is_cancelled() {
                return Err(TradeError::Cancelled);
            }
            // Closing, or an exit check is placing orders right now
            if self.store.info(&position.key()).map_or(true, |info| !info.is_checkable()) {
                debug!("{} {} busy, not averaged this cycle", position.symbol, position.side);
                continue;
            }
            let result = by_symbol.get(position.symbol.as_str());
            let Some(price) = result
                .map(|r| r.last_price)
                .or_else(|| prices.get(&position.symbol).copied())
            else {
                continue;
            };
            let roe = calculator::roe(position.side, position.entry_price, price, position.leverage);
            let signal = result.map(|r| &r.signal);

            if !should_average(&position, price, roe, signal, &self.options) {
                continue;
            }
            info!("➕ Averaging {} {} | ROE {:.2}%", position.symbol, position.side, roe);

            let filters = match self.symbol_filters(&position.symbol).await {
                Ok(filters) => filters,
                Err(e) => {
                    warn!("⚠️  {} not averaged: {}", position.symbol, e);
                    summary.failed += 1;
                    continue;
                }
            };
            let margin =
                calculator::margin_from_percent(balance.available_balance, self.options.average_margin_percent);

            match self
                .endpoints
                .place_average_order(&position, price, margin, &filters, cancel)
                .await
            {
                Ok(_) => summary.averaged += 1,
                Err(TradeError::Cancelled) => return Err(TradeError::Cancelled),
                Err(e) => {
                    summary.failed += 1;
                    self.report_failure(&position, "average", &e);
                }
            }
        }
        Ok(())
    }

    /// Stopping: cancel tasks, release streams, drop tracking.
    pub async fn finish(&self, is_forced: bool) -> TradeResult<()> {
        info!("🛑 Finishing strategy {} (forced: {})", self.name, is_forced);
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("🔥 CRITICAL | strategy task failed: {}", e);
                }
            }
        }

        self.worker.release_all().await;
        self.streams.unsubscribe_all().await;

        if !is_forced {
            let symbols: HashSet<String> = self.store.all().into_iter().map(|p| p.symbol).collect();
            for symbol in symbols {
                if let Err(e) = self.exchange.cancel_all_orders(&symbol).await {
                    warn!("Resting orders on {} not cancelled: {}", symbol, e);
                }
            }
        }

        self.store.clear();
        self.latest_signals.clear();
        self.notifications
            .publish(telegram::format_shutdown(&self.name, is_forced));
        Ok(())
    }

    async fn refresh_balance(&self) -> TradeResult<Balance> {
        let balance = self.exchange.get_balance().await?;
        self.set_available_balance_percent(balance.available_percent());
        Ok(balance)
    }

    async fn refresh_symbol_filters(&self) -> TradeResult<()> {
        let filters = self.exchange.get_symbol_filters().await.map_err(|e| {
            error!("❌ Instrument filters unavailable: {}", e);
            TradeError::Client(e)
        })?;
        for f in filters {
            self.symbol_filters.insert(f.symbol.clone(), f);
        }
        Ok(())
    }

    /// Cached instrument filters; refreshed once on a miss.
    async fn symbol_filters(&self, symbol: &str) -> TradeResult<SymbolFilters> {
        if let Some(filters) = self.symbol_filters.get(symbol) {
            return Ok(filters.clone());
        }
        self.refresh_symbol_filters().await?;
        self.symbol_filters
            .get(symbol)
            .map(|f| f.clone())
            .ok_or_else(|| TradeError::system(format!("no instrument filters for {}", symbol)))
    }

    fn report_failure(&self, position: &Position, action: &str, error: &TradeError) {
        if error.is_cancelled() {
            return;
        }
        warn!("❌ {} {} {} failed: {}", action, position.symbol, position.side, error);
        self.notifications.publish(telegram::format_order_failed(
            &position.symbol,
            position.side,
            action,
            &error.to_string(),
        ));
    }
}

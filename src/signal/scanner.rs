//! Per-cycle evaluation of the symbol universe.
//!
//! Symbols are split into `scan_parallelism` groups; each group runs as one
//! task and walks its slice sequentially, which caps concurrent REST calls.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::calculator;
use crate::config::TradeLogicOptions;
use crate::error::{TradeError, TradeResult};
use crate::exchange::{fetch_klines_range, ExchangeClient, Kline, Ticker24h};

use super::{cluster_trades, evaluate, Signal};

/// One symbol's evaluation output for a single cycle.
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub symbol: String,
    pub signal: Signal,
    pub last_price: f64,
    /// 24h quote volume.
    pub quote_volume: f64,
    /// Trades inside the evaluated candle.
    pub trade_count: usize,
    pub kline: Kline,
}

pub type SymbolMarketInfo = InstanceResult;

impl InstanceResult {
    /// Dominant taker volume divided by the other side, signed by direction:
    /// positive when buyers dominate.
    pub fn volume_ratio(&self) -> f64 {
        let buy = self.signal.buy_volume;
        let sell = self.signal.sell_volume;
        if buy >= sell {
            if sell == 0.0 { f64::INFINITY } else { buy / sell }
        } else if buy == 0.0 {
            f64::NEG_INFINITY
        } else {
            -(sell / buy)
        }
    }
}

/// Candle volume must reach `coefficient` times the average of `history`.
pub fn passes_volume_filter(history: &[Kline], candidate: &Kline, coefficient: f64) -> bool {
    if history.is_empty() {
        return true;
    }
    let volumes: Vec<f64> = history.iter().map(|k| k.volume).collect();
    candidate.volume >= calculator::simple_average(&volumes) * coefficient
}

/// Evaluate the last closed candle of one symbol.
///
/// `Ok(None)` means the symbol was filtered out before evaluation.
pub async fn evaluate_symbol(
    exchange: &dyn ExchangeClient,
    ticker: &Ticker24h,
    options: &TradeLogicOptions,
    now_ms: i64,
) -> TradeResult<Option<InstanceResult>> {
    let interval_ms = i64::from(options.kline_interval_minutes.max(1)) * 60_000;
    let lookback = options.volume_ma_period as i64 + 2;
    let start = now_ms - interval_ms * lookback;

    let klines = fetch_klines_range(exchange, &ticker.symbol, options.kline_interval_minutes, start, now_ms).await?;
    let closed: Vec<Kline> = klines.into_iter().filter(|k| k.close_time <= now_ms).collect();

    let Some((candidate, history)) = closed.split_last() else {
        debug!("{}: no closed candle", ticker.symbol);
        return Ok(None);
    };
    let history = &history[history.len().saturating_sub(options.volume_ma_period)..];

    if !passes_volume_filter(history, candidate, options.volume_ma_coefficient) {
        debug!("{}: candle volume below average", ticker.symbol);
        return Ok(None);
    }

    let trades = exchange
        .get_trades(&ticker.symbol, candidate.open_time, candidate.close_time)
        .await?;
    let clusters = cluster_trades(&trades);
    let book = exchange.get_order_book(&ticker.symbol, options.depth_limit).await?;

    let signal = evaluate(&ticker.symbol, candidate, &clusters, &book, &options.signal_options());

    Ok(Some(InstanceResult {
        symbol: ticker.symbol.clone(),
        signal,
        last_price: ticker.last_price,
        quote_volume: ticker.quote_volume,
        trade_count: trades.len(),
        kline: candidate.clone(),
    }))
}

/// Evaluate every symbol in `universe`. Per-symbol failures are logged and
/// skipped; cancellation ends the scan early with `Cancelled`.
pub async fn scan_universe(
    exchange: Arc<dyn ExchangeClient>,
    universe: Vec<Ticker24h>,
    options: Arc<TradeLogicOptions>,
    cancel: CancellationToken,
) -> TradeResult<Vec<InstanceResult>> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut tasks = JoinSet::new();

    for group in calculator::split_into_groups(&universe, options.scan_parallelism) {
        let exchange = exchange.clone();
        let options = options.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let mut results = Vec::with_capacity(group.len());
            for ticker in group {
                if cancel.is_cancelled() {
                    break;
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = evaluate_symbol(exchange.as_ref(), &ticker, &options, now_ms) => outcome,
                };
                match outcome {
                    Ok(Some(result)) => results.push(result),
                    Ok(None) => {}
                    Err(e) => warn!("⚠️  {} skipped this cycle: {}", ticker.symbol, e),
                }
            }
            results
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(group_results) => results.extend(group_results),
            Err(e) => error!("🔥 CRITICAL | scan group failed: {}", e),
        }
    }

    if cancel.is_cancelled() {
        warn!("Scan cancelled after {} symbols", results.len());
        return Err(TradeError::Cancelled);
    }

    results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Ok(results)
}

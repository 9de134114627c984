//! Order filters: pure decisions over signals, positions and prices.

use std::cmp::Ordering;

use crate::calculator;
use crate::config::TradeLogicOptions;
use crate::exchange::PositionSide;
use crate::position::{Position, PositionInfo, PositionStore};
use crate::signal::{InstanceResult, Signal, SignalSide};

/// A symbol that passed every open gate this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenCandidate {
    pub symbol: String,
    pub side: PositionSide,
    pub last_price: f64,
    pub quote_volume: f64,
    pub strong: bool,
}

/// Why a position is closed at market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    TakeProfit,
    ForceClose,
    /// Market-stop conditions hold but the lock price is already behind us.
    StopPassed,
}

/// Outcome of the per-tick exit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    None,
    MarketClose { reason: CloseReason },
    PlaceTrailingStop { activation_price: f64, callback_rate: f64 },
    PlaceMarketStop { trigger_price: f64 },
}

/// Inputs of the exit check that are not part of the position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitContext {
    pub price: f64,
    pub now_ms: i64,
    /// Available balance as percent of wallet balance.
    pub available_balance_percent: f64,
}

/// Taker volume of `side` divided by the other side's.
fn side_volume_ratio(signal: &Signal, side: PositionSide) -> f64 {
    let (ours, theirs) = match side {
        PositionSide::Long => (signal.buy_volume, signal.sell_volume),
        PositionSide::Short => (signal.sell_volume, signal.buy_volume),
    };
    if theirs <= 0.0 {
        if ours > 0.0 { f64::INFINITY } else { 0.0 }
    } else {
        ours / theirs
    }
}

/// Pick a side for a signal. Neutral signals follow the dominant taker side.
pub fn resolve_side(signal: &Signal) -> Option<PositionSide> {
    match signal.side {
        SignalSide::Both => match signal.buy_volume.partial_cmp(&signal.sell_volume) {
            Some(Ordering::Greater) => Some(PositionSide::Long),
            Some(Ordering::Less) => Some(PositionSide::Short),
            _ => None,
        },
        side => side.position_side(),
    }
}

/// Gates a single evaluation result must pass to open. Returns the side.
pub fn check_open(result: &InstanceResult, options: &TradeLogicOptions) -> Option<PositionSide> {
    let signal = &result.signal;
    if !signal.is_available() || !signal.strength.meets(options.open_min_strength) {
        return None;
    }
    if options.strict_poc_in_body && !signal.poc_in_body {
        return None;
    }
    if result.quote_volume < options.min_quote_volume || result.trade_count < options.min_trade_count {
        return None;
    }

    let side = resolve_side(signal)?;
    if !options.allowed_sides.allows(side) {
        return None;
    }
    if options.volume_imbalance_coefficient > 0.0
        && side_volume_ratio(signal, side) < options.volume_imbalance_coefficient
    {
        return None;
    }

    Some(side)
}

/// Symbols eligible to open this cycle, best first.
///
/// Free slots are `max_positions` minus the larger of the tracked count and
/// the exchange-reported count, further capped per cycle.
pub fn open_candidates(
    results: &[InstanceResult],
    store: &PositionStore,
    exchange_position_count: usize,
    options: &TradeLogicOptions,
) -> Vec<OpenCandidate> {
    let open = store.len().max(exchange_position_count);
    let slots = options
        .max_positions
        .saturating_sub(open)
        .min(options.max_positions_per_cycle);
    if slots == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<OpenCandidate> = results
        .iter()
        .filter_map(|result| {
            let side = check_open(result, options)?;
            if store.contains(&crate::position::PositionKey::new(result.symbol.clone(), side)) {
                return None;
            }
            Some(OpenCandidate {
                symbol: result.symbol.clone(),
                side,
                last_price: result.last_price,
                quote_volume: result.quote_volume,
                strong: result.signal.strength.is_strong(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.strong
            .cmp(&a.strong)
            .then(b.quote_volume.partial_cmp(&a.quote_volume).unwrap_or(Ordering::Equal))
            .then(a.symbol.cmp(&b.symbol))
    });
    candidates.truncate(slots);
    candidates
}

/// Averaging gate: ROE inside `[average_roe_from, average_roe_to]` and a
/// same-side signal of the required strength.
pub fn is_need_to_place_average_order(
    position: &Position,
    roe: f64,
    signal: Option<&Signal>,
    options: &TradeLogicOptions,
) -> bool {
    if roe < options.average_roe_from || roe > options.average_roe_to {
        return false;
    }
    let Some(signal) = signal else {
        return false;
    };
    signal.strength.meets(options.average_min_strength) && resolve_side(signal) == Some(position.side)
}

/// Percent-move gate: price must also have moved at least
/// `average_percent_move` against the position since the last fill.
pub fn is_need_to_place_percent_move_average(
    position: &Position,
    price: f64,
    roe: f64,
    signal: Option<&Signal>,
    options: &TradeLogicOptions,
) -> bool {
    if !is_need_to_place_average_order(position, roe, signal, options) {
        return false;
    }
    let moved = calculator::percent_of_move(position.last_order_price, price);
    let adverse = match position.side {
        PositionSide::Long => -moved,
        PositionSide::Short => moved,
    };
    adverse >= options.average_percent_move
}

fn market_stop_conditions_hold(
    info: &PositionInfo,
    roe: f64,
    context: &ExitContext,
    options: &TradeLogicOptions,
) -> bool {
    let Some(stop) = options.market_stop else {
        return false;
    };
    if !stop.has_conditions() {
        return false;
    }
    if stop.min_roe.is_some_and(|min_roe| roe < min_roe) {
        return false;
    }
    if stop
        .after_secs
        .is_some_and(|secs| context.now_ms - info.opened_at < secs as i64 * 1000)
    {
        return false;
    }
    if stop
        .max_available_balance_percent
        .is_some_and(|max| context.available_balance_percent > max)
    {
        return false;
    }
    true
}

/// Exit decision for one tick.
pub fn exit_action(
    position: &Position,
    info: &PositionInfo,
    context: &ExitContext,
    options: &TradeLogicOptions,
) -> ExitAction {
    if context.price <= 0.0 || position.entry_price <= 0.0 {
        return ExitAction::None;
    }
    let roe = calculator::roe(position.side, position.entry_price, context.price, position.leverage);

    if options.force_close_roe.is_some_and(|limit| roe <= limit) {
        return ExitAction::MarketClose { reason: CloseReason::ForceClose };
    }
    if options.take_profit_roe.is_some_and(|target| roe >= target) {
        return ExitAction::MarketClose { reason: CloseReason::TakeProfit };
    }

    if let Some(trailing) = options.trailing_stop {
        if info.needs_trailing_stop() && roe >= trailing.activation_roe {
            return ExitAction::PlaceTrailingStop {
                activation_price: context.price,
                callback_rate: trailing.callback_rate,
            };
        }
    }

    if info.needs_market_stop() && market_stop_conditions_hold(info, roe, context, options) {
        let lock_roe = options.market_stop.map_or(0.0, |stop| stop.lock_roe);
        let trigger_price =
            calculator::price_for_roe(position.side, position.entry_price, position.leverage, lock_roe);
        let protective = match position.side {
            PositionSide::Long => trigger_price < context.price,
            PositionSide::Short => trigger_price > context.price,
        };
        return if protective {
            ExitAction::PlaceMarketStop { trigger_price }
        } else {
            ExitAction::MarketClose { reason: CloseReason::StopPassed }
        };
    }

    ExitAction::None
}

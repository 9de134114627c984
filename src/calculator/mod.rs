//! Pure numeric helpers. No state, no I/O.

use crate::exchange::{PositionSide, SymbolFilters};

/// Quantities closer to zero than this are treated as flat.
pub const QUANTITY_EPSILON: f64 = 1e-9;

#[inline]
pub fn is_zero_quantity(quantity: f64) -> bool {
    quantity.abs() < QUANTITY_EPSILON
}

/// Absolute PnL in quote currency.
pub fn pnl(side: PositionSide, entry_price: f64, price: f64, quantity: f64) -> f64 {
    match side {
        PositionSide::Long => (price - entry_price) * quantity,
        PositionSide::Short => (entry_price - price) * quantity,
    }
}

/// Favourable price move in percent, unleveraged.
pub fn pnl_percent(side: PositionSide, entry_price: f64, price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    match side {
        PositionSide::Long => (price - entry_price) / entry_price * 100.0,
        PositionSide::Short => (entry_price - price) / entry_price * 100.0,
    }
}

/// Return on equity in percent of committed margin.
pub fn roe(side: PositionSide, entry_price: f64, price: f64, leverage: u32) -> f64 {
    pnl_percent(side, entry_price, price) * f64::from(leverage.max(1))
}

/// Price at which a position reaches `roe_percent`.
pub fn price_for_roe(side: PositionSide, entry_price: f64, leverage: u32, roe_percent: f64) -> f64 {
    let move_fraction = roe_percent / 100.0 / f64::from(leverage.max(1));
    match side {
        PositionSide::Long => entry_price * (1.0 + move_fraction),
        PositionSide::Short => entry_price * (1.0 - move_fraction),
    }
}

/// Signed percent change from `from` to `to`.
pub fn percent_of_move(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        return 0.0;
    }
    (to - from) / from * 100.0
}

/// Strip floating noise such as 0.30000000000000004.
#[inline]
fn clean(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

/// Round down to a multiple of `step`.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    clean((value / step + QUANTITY_EPSILON).floor() * step)
}

/// Round up to a multiple of `step`.
pub fn round_up_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    clean((value / step - QUANTITY_EPSILON).ceil() * step)
}

/// Round to the nearest multiple of `tick`.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    clean((price / tick).round() * tick)
}

/// Margin amount representing `percent` of `balance`.
pub fn margin_from_percent(balance: f64, percent: f64) -> f64 {
    (balance * percent / 100.0).max(0.0)
}

/// Order quantity buying `margin * leverage` of notional at `price`,
/// rounded down to the lot step.
///
/// Returns `None` when the result cannot satisfy the symbol's minimum
/// quantity or minimum notional.
pub fn order_quantity(margin: f64, leverage: u32, price: f64, filters: &SymbolFilters) -> Option<f64> {
    if price <= 0.0 || margin <= 0.0 {
        return None;
    }

    let notional = margin * f64::from(leverage.max(1));
    let quantity = round_down_to_step(notional / price, filters.step_size);

    if quantity < filters.min_quantity || is_zero_quantity(quantity) {
        return None;
    }
    if quantity * price < filters.min_notional {
        return None;
    }

    Some(quantity)
}

/// Volume-weighted entry after adding `fill_quantity` at `fill_price`.
pub fn weighted_entry_price(quantity: f64, entry_price: f64, fill_quantity: f64, fill_price: f64) -> f64 {
    let total = quantity + fill_quantity;
    if is_zero_quantity(total) {
        return entry_price;
    }
    (quantity * entry_price + fill_quantity * fill_price) / total
}

/// Split `[start, end]` into consecutive windows no longer than `step`,
/// for APIs that cap how much a single call can return.
pub fn iteration_chunks(start: i64, end: i64, step: i64) -> Vec<(i64, i64)> {
    if end < start {
        return Vec::new();
    }
    if step <= 0 {
        return vec![(start, end)];
    }

    let mut chunks = Vec::new();
    let mut from = start;
    while from <= end {
        let to = from.saturating_add(step).min(end);
        chunks.push((from, to));
        if to == end {
            break;
        }
        from = to;
    }
    chunks
}

/// Split items into at most `groups` contiguous slices of near-equal size.
pub fn split_into_groups<T: Clone>(items: &[T], groups: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let groups = groups.clamp(1, items.len());
    let size = (items.len() + groups - 1) / groups;
    items.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

/// Simple moving average of the given values.
pub fn simple_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            symbol: "ETHUSDT".to_string(),
            base_asset: "ETH".to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            step_size: 0.01,
            min_quantity: 0.01,
            min_notional: 5.0,
            max_leverage: 100,
        }
    }

    #[test]
    fn test_pnl_and_roe() {
        assert_eq!(pnl(PositionSide::Long, 100.0, 110.0, 2.0), 20.0);
        assert_eq!(pnl(PositionSide::Short, 100.0, 110.0, 2.0), -20.0);

        let roe_long = roe(PositionSide::Long, 100.0, 97.0, 2);
        assert!((roe_long - -6.0).abs() < 1e-9);

        let roe_short = roe(PositionSide::Short, 100.0, 97.0, 10);
        assert!((roe_short - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_price_for_roe_inverts_roe() {
        for side in PositionSide::BOTH {
            let price = price_for_roe(side, 2000.0, 20, 15.0);
            assert!((roe(side, 2000.0, price, 20) - 15.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_down_to_step(0.129, 0.01), 0.12);
        assert_eq!(round_down_to_step(0.3, 0.1), 0.3);
        assert_eq!(round_up_to_step(0.121, 0.01), 0.13);
        assert_eq!(round_to_tick(100.16, 0.1), 100.2);
        assert_eq!(round_down_to_step(5.5, 0.0), 5.5);
    }

    #[test]
    fn test_order_quantity() {
        // 10 USDT margin at 5x = 50 USDT notional, ETH at 2000
        assert_eq!(order_quantity(10.0, 5, 2000.0, &filters()), Some(0.02));
        // 1 USDT at 1x is below min notional
        assert_eq!(order_quantity(1.0, 1, 2000.0, &filters()), None);
        assert_eq!(order_quantity(10.0, 5, 0.0, &filters()), None);
    }

    #[test]
    fn test_iteration_chunks() {
        assert_eq!(iteration_chunks(0, 25, 10), vec![(0, 10), (10, 20), (20, 25)]);
        assert_eq!(iteration_chunks(0, 10, 10), vec![(0, 10)]);
        assert!(iteration_chunks(10, 0, 5).is_empty());
    }

    #[test]
    fn test_split_into_groups() {
        let items: Vec<u32> = (0..10).collect();
        let groups = split_into_groups(&items, 3);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups.iter().map(Vec::len).sum::<usize>(), 10);
        assert_eq!(split_into_groups(&items, 50).len(), 10);
        assert!(split_into_groups::<u32>(&[], 4).is_empty());
    }

    #[test]
    fn test_weighted_entry() {
        let entry = weighted_entry_price(1.0, 100.0, 1.0, 90.0);
        assert_eq!(entry, 95.0);
        assert!((percent_of_move(100.0, 95.0) - -5.0).abs() < 1e-9);
    }
}

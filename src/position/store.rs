use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::StoreError;
use crate::exchange::PositionSide;

/// Store key: one position per symbol and side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.side)
    }
}

/// One open exposure. Quantity is stored as a non-negative magnitude.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub total_quantity: f64,
    pub leverage: u32,
    /// Price of the most recent fill on this position.
    pub last_order_price: f64,
    /// Exchange time of the last change, ms.
    pub update_time: i64,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.side)
    }

    pub fn notional(&self, price: f64) -> f64 {
        self.total_quantity * price
    }
}

/// Split "BTCUSDT" into ("BTC", "USDT") for a known quote asset.
pub fn split_symbol(symbol: &str, quote_asset: &str) -> (String, String) {
    match symbol.strip_suffix(quote_asset) {
        Some(base) if !base.is_empty() => (base.to_string(), quote_asset.to_string()),
        _ => (symbol.to_string(), String::new()),
    }
}

/// Control flags paired with a position.
#[derive(Debug)]
pub struct PositionInfo {
    needs_check: AtomicBool,
    needs_market_stop: AtomicBool,
    needs_trailing_stop: AtomicBool,
    /// Set while a placed market close waits for its fill.
    closing: AtomicBool,
    /// Time the position was opened, ms. Exchange time for reconciled
    /// positions, local tracking time otherwise.
    pub opened_at: i64,
}

impl PositionInfo {
    pub fn new(opened_at: i64) -> Self {
        Self {
            needs_check: AtomicBool::new(true),
            needs_market_stop: AtomicBool::new(true),
            needs_trailing_stop: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            opened_at,
        }
    }

    /// Try to take the single evaluation slot. Returns `None` while another
    /// evaluation holds it; the slot is released when the guard drops.
    pub fn try_begin_check(self: &Arc<Self>) -> Option<CheckGuard> {
        self.needs_check
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CheckGuard {
                info: Arc::clone(self),
                restore: true,
            })
    }

    pub fn is_checkable(&self) -> bool {
        self.needs_check.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Leave the Closing state: a fill changed the position without
    /// removing it, so whatever remains is checked again. Returns whether
    /// the position was closing.
    pub fn reopen_checks(&self) -> bool {
        if self.closing.swap(false, Ordering::AcqRel) {
            self.needs_check.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn needs_market_stop(&self) -> bool {
        self.needs_market_stop.load(Ordering::Acquire)
    }

    pub fn set_needs_market_stop(&self, value: bool) {
        self.needs_market_stop.store(value, Ordering::Release);
    }

    pub fn needs_trailing_stop(&self) -> bool {
        self.needs_trailing_stop.load(Ordering::Acquire)
    }

    pub fn set_needs_trailing_stop(&self, value: bool) {
        self.needs_trailing_stop.store(value, Ordering::Release);
    }

    /// Re-arm stop placement, e.g. after the entry price moved.
    pub fn rearm_stops(&self) {
        self.set_needs_market_stop(true);
        self.set_needs_trailing_stop(true);
    }
}

/// Holds a position's check slot; releases it on drop.
#[derive(Debug)]
pub struct CheckGuard {
    info: Arc<PositionInfo>,
    restore: bool,
}

impl CheckGuard {
    /// Keep the slot taken: the position is closing and is not checked
    /// again until a fill removes or changes it.
    pub fn hold(mut self) {
        self.info.closing.store(true, Ordering::Release);
        self.restore = false;
    }
}

impl Drop for CheckGuard {
    fn drop(&mut self) {
        if self.restore {
            self.info.needs_check.store(true, Ordering::Release);
        }
    }
}

struct Slot {
    position: Position,
    info: Arc<PositionInfo>,
}

/// Registry of open positions, safe to share between the account-update
/// writer and ticker readers. Each key lives in one dashmap shard, so a
/// position and its info are always added and removed together.
#[derive(Default)]
pub struct PositionStore {
    slots: DashMap<PositionKey, Slot>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Insert a new position with fresh flags. A second position for the
    /// same (symbol, side) is a logic error.
    pub fn add(&self, position: Position, opened_at: i64) -> Result<Arc<PositionInfo>, StoreError> {
        match self.slots.entry(position.key()) {
            Entry::Occupied(entry) => Err(StoreError::DuplicatePosition(entry.key().clone())),
            Entry::Vacant(entry) => {
                let info = Arc::new(PositionInfo::new(opened_at));
                entry.insert(Slot {
                    position,
                    info: Arc::clone(&info),
                });
                Ok(info)
            }
        }
    }

    pub fn remove(&self, key: &PositionKey) -> Option<Position> {
        self.slots.remove(key).map(|(_, slot)| slot.position)
    }

    pub fn find(&self, key: &PositionKey) -> Option<Position> {
        self.slots.get(key).map(|slot| slot.position.clone())
    }

    pub fn info(&self, key: &PositionKey) -> Option<Arc<PositionInfo>> {
        self.slots.get(key).map(|slot| Arc::clone(&slot.info))
    }

    pub fn contains(&self, key: &PositionKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Mutate a position in place; returns the updated copy.
    pub fn update<F>(&self, key: &PositionKey, f: F) -> Option<Position>
    where
        F: FnOnce(&mut Position),
    {
        self.slots.get_mut(key).map(|mut slot| {
            f(&mut slot.position);
            slot.position.clone()
        })
    }

    /// Snapshot of all positions, sorted by key.
    pub fn all(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.slots.iter().map(|slot| slot.position.clone()).collect();
        positions.sort_by(|a, b| a.key().cmp(&b.key()));
        positions
    }

    /// Whether any side of `symbol` is still tracked.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        PositionSide::BOTH
            .iter()
            .any(|side| self.slots.contains_key(&PositionKey::new(symbol, *side)))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, side: PositionSide, quantity: f64) -> Position {
        let (base, quote) = split_symbol(symbol, "USDT");
        Position {
            symbol: symbol.to_string(),
            base_asset: base,
            quote_asset: quote,
            side,
            entry_price: 100.0,
            total_quantity: quantity,
            leverage: 10,
            last_order_price: 100.0,
            update_time: 0,
        }
    }

    #[test]
    fn test_add_rejects_duplicate_key() {
        let store = PositionStore::new();
        store.add(position("BTCUSDT", PositionSide::Long, 1.0), 0).unwrap();

        let err = store.add(position("BTCUSDT", PositionSide::Long, 2.0), 0).unwrap_err();
        assert_eq!(
            err,
            StoreError::DuplicatePosition(PositionKey::new("BTCUSDT", PositionSide::Long))
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.find(&PositionKey::new("BTCUSDT", PositionSide::Long)).unwrap().total_quantity, 1.0);
    }

    #[test]
    fn test_hedge_mode_allows_both_sides() {
        let store = PositionStore::new();
        store.add(position("BTCUSDT", PositionSide::Long, 1.0), 0).unwrap();
        store.add(position("BTCUSDT", PositionSide::Short, 1.0), 0).unwrap();

        assert_eq!(store.len(), 2);
        store.remove(&PositionKey::new("BTCUSDT", PositionSide::Long));
        assert!(store.has_symbol("BTCUSDT"));
        store.remove(&PositionKey::new("BTCUSDT", PositionSide::Short));
        assert!(!store.has_symbol("BTCUSDT"));
        assert!(store.info(&PositionKey::new("BTCUSDT", PositionSide::Short)).is_none());
    }

    #[test]
    fn test_update_in_place() {
        let store = PositionStore::new();
        let key = PositionKey::new("ETHUSDT", PositionSide::Short);
        store.add(position("ETHUSDT", PositionSide::Short, 1.0), 0).unwrap();

        let updated = store.update(&key, |p| p.total_quantity += 0.5).unwrap();
        assert_eq!(updated.total_quantity, 1.5);
        assert!(store.update(&PositionKey::new("XRPUSDT", PositionSide::Long), |_| {}).is_none());
    }

    #[test]
    fn test_check_slot_is_single() {
        let info = Arc::new(PositionInfo::new(0));

        let guard = info.try_begin_check().expect("slot free");
        assert!(!info.is_checkable());
        assert!(info.try_begin_check().is_none());

        drop(guard);
        assert!(info.is_checkable());
        assert!(info.try_begin_check().is_some());
    }

    #[test]
    fn test_held_slot_stays_taken() {
        let info = Arc::new(PositionInfo::new(0));
        info.try_begin_check().unwrap().hold();
        assert!(!info.is_checkable());
        assert!(info.is_closing());
        assert!(info.try_begin_check().is_none());
    }

    #[test]
    fn test_reopen_checks_only_after_hold() {
        let info = Arc::new(PositionInfo::new(0));

        // An ordinary in-flight check is not released early
        let guard = info.try_begin_check().unwrap();
        assert!(!info.reopen_checks());
        assert!(!info.is_checkable());
        drop(guard);

        info.try_begin_check().unwrap().hold();
        assert!(info.reopen_checks());
        assert!(info.is_checkable());
        assert!(!info.is_closing());
        assert!(info.try_begin_check().is_some());
    }

    #[test]
    fn test_check_slot_under_contention() {
        let info = Arc::new(PositionInfo::new(0));
        let acquired = std::sync::atomic::AtomicUsize::new(0);
        let _held = info.try_begin_check().unwrap();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    if info.try_begin_check().is_some() {
                        acquired.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(acquired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_stops() {
        let info = PositionInfo::new(0);
        info.set_needs_market_stop(false);
        info.set_needs_trailing_stop(false);
        info.rearm_stops();
        assert!(info.needs_market_stop());
        assert!(info.needs_trailing_stop());
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTCUSDT", "USDT"), ("BTC".to_string(), "USDT".to_string()));
        assert_eq!(split_symbol("USDT", "USDT"), ("USDT".to_string(), String::new()));
    }
}

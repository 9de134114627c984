use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// Hedge-mode position side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub const BOTH: [PositionSide; 2] = [PositionSide::Long, PositionSide::Short];

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that grows a position of this side.
    pub fn opening_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position of this side.
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "Long"),
            PositionSide::Short => write!(f, "Short"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    #[default]
    Isolated,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

impl Kline {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn body_low(&self) -> f64 {
        self.open.min(self.close)
    }

    pub fn body_high(&self) -> f64 {
        self.open.max(self.close)
    }
}

/// A public trade. `side` is the taker side.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub price: f64,
    pub quantity: f64,
    pub side: OrderSide,
    pub time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// (price, quantity), best first
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    pub quote_volume: f64,
    pub volume: f64,
}

/// A streamed last-price update for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    pub timestamp: i64,
}

/// Trading rules of a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_quantity: f64,
    pub min_notional: f64,
    pub max_leverage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Market,
    /// Conditional market order fired at `trigger_price`.
    StopMarket { trigger_price: f64 },
    /// Exchange-side trailing stop, armed at `activation_price`.
    TrailingStop { activation_price: f64, callback_rate: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub kind: OrderKind,
    pub quantity: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Other,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TrailingStop,
    Other,
}

/// Account-stream order event, in exchange delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Original order quantity.
    pub quantity: f64,
    pub cumulative_filled_quantity: f64,
    /// Quantity executed by this event alone.
    pub last_filled_quantity: f64,
    pub average_price: f64,
    pub last_filled_price: f64,
    pub realized_profit: f64,
    pub reduce_only: bool,
    pub update_time: i64,
}

impl OrderUpdate {
    /// True when the fill shrinks the position (a "withdraw").
    pub fn is_reducing(&self) -> bool {
        self.reduce_only
            || self.realized_profit != 0.0
            || self.side == self.position_side.closing_order_side()
    }

    pub fn has_fill(&self) -> bool {
        self.last_filled_quantity > 0.0
            && matches!(self.status, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Option<PositionSide>,
    pub status: OrderStatus,
    pub average_price: f64,
    pub quantity: f64,
    pub update_time: i64,
}

/// Exchange-reported open position.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub update_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Balance {
    pub asset: String,
    pub wallet_balance: f64,
    pub available_balance: f64,
}

impl Balance {
    /// Available balance as percent of wallet balance.
    pub fn available_percent(&self) -> f64 {
        if self.wallet_balance <= 0.0 {
            return 0.0;
        }
        self.available_balance / self.wallet_balance * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: OrderSide, position_side: PositionSide, realized: f64) -> OrderUpdate {
        OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: "1".to_string(),
            side,
            position_side,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            quantity: 1.0,
            cumulative_filled_quantity: 1.0,
            last_filled_quantity: 1.0,
            average_price: 50000.0,
            last_filled_price: 50000.0,
            realized_profit: realized,
            reduce_only: false,
            update_time: 1,
        }
    }

    #[test]
    fn test_reducing_detection() {
        assert!(!fill(OrderSide::Buy, PositionSide::Long, 0.0).is_reducing());
        assert!(fill(OrderSide::Sell, PositionSide::Long, 0.0).is_reducing());
        assert!(fill(OrderSide::Buy, PositionSide::Short, 12.5).is_reducing());
        assert!(!fill(OrderSide::Sell, PositionSide::Short, 0.0).is_reducing());
    }

    #[test]
    fn test_available_percent() {
        let balance = Balance {
            asset: "USDT".to_string(),
            wallet_balance: 200.0,
            available_balance: 50.0,
        };
        assert_eq!(balance.available_percent(), 25.0);
        assert_eq!(Balance::default().available_percent(), 0.0);
    }
}

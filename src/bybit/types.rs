//! Bybit v5 wire payloads. Numbers arrive as strings.

use serde::{Deserialize, Serialize};

use crate::exchange::{OrderSide, OrderStatus, OrderType, PositionSide};

/// Parse a numeric string, treating blanks and garbage as zero.
pub fn parse_f64(value: &str) -> f64 {
    value.trim().parse().unwrap_or(0.0)
}

pub fn parse_i64(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

pub fn parse_side(value: &str) -> Option<OrderSide> {
    match value {
        "Buy" => Some(OrderSide::Buy),
        "Sell" => Some(OrderSide::Sell),
        _ => None,
    }
}

/// Hedge-mode position index: 1 long, 2 short, 0 one-way.
pub fn position_side_from_idx(idx: i64) -> Option<PositionSide> {
    match idx {
        1 => Some(PositionSide::Long),
        2 => Some(PositionSide::Short),
        _ => None,
    }
}

pub fn position_idx(side: PositionSide) -> i64 {
    match side {
        PositionSide::Long => 1,
        PositionSide::Short => 2,
    }
}

pub fn parse_order_status(value: &str) -> OrderStatus {
    match value {
        "New" | "Untriggered" | "Triggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "Deactivated" | "PartiallyFilledCanceled" => OrderStatus::Cancelled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Other,
    }
}

pub fn parse_order_type(order_type: &str, stop_order_type: &str) -> OrderType {
    match (order_type, stop_order_type) {
        (_, "TrailingStop") => OrderType::TrailingStop,
        ("Market", "Stop" | "StopLoss" | "TakeProfit" | "PartialStopLoss" | "PartialTakeProfit") => {
            OrderType::StopMarket
        }
        ("Market", _) => OrderType::Market,
        ("Limit", _) => OrderType::Limit,
        _ => OrderType::Other,
    }
}

/// Envelope of every REST response.
#[derive(Debug, Clone, Deserialize)]
pub struct RestResponse {
    #[serde(rename = "retCode")]
    pub ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerInfo {
    pub symbol: String,
    #[serde(default)]
    pub last_price: String,
    #[serde(default)]
    pub turnover24h: String,
    #[serde(default)]
    pub volume24h: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublicTrade {
    pub price: String,
    pub size: String,
    pub side: String,
    pub time: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderbookResult {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bids: Vec<(String, String)>,
    #[serde(rename = "a")]
    pub asks: Vec<(String, String)>,
    #[serde(default)]
    pub ts: i64,
}

impl OrderbookResult {
    pub fn parse_levels(&self) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let parse = |levels: &[(String, String)]| -> Vec<(f64, f64)> {
            levels
                .iter()
                .filter_map(|(p, q)| Some((p.parse().ok()?, q.parse().ok()?)))
                .collect()
        };
        (parse(&self.bids), parse(&self.asks))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageFilter {
    #[serde(default)]
    pub max_leverage: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
    #[serde(default)]
    pub tick_size: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
    #[serde(default)]
    pub qty_step: String,
    #[serde(default)]
    pub min_order_qty: String,
    #[serde(default)]
    pub min_notional_value: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentInfo {
    pub symbol: String,
    #[serde(default)]
    pub base_coin: String,
    #[serde(default)]
    pub quote_coin: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub leverage_filter: LeverageFilter,
    #[serde(default)]
    pub price_filter: PriceFilter,
    #[serde(default)]
    pub lot_size_filter: LotSizeFilter,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(default)]
    pub position_idx: i64,
    #[serde(default)]
    pub order_status: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub updated_time: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub position_idx: i64,
    #[serde(default)]
    pub updated_time: String,
}

/// `tickers.{symbol}` push. Deltas omit unchanged fields.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub symbol: String,
    pub last_price: Option<String>,
}

/// One entry of the private `order` topic.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderData {
    #[serde(default)]
    pub category: String,
    pub symbol: String,
    pub order_id: String,
    pub side: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub stop_order_type: String,
    #[serde(default)]
    pub order_status: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub cum_exec_value: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub closed_pnl: String,
    #[serde(default)]
    pub position_idx: i64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub updated_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsMessage {
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub data: Option<serde_json::Value>,
    pub ts: Option<u64>,
}

/// Reply to `auth` / `subscribe` / `unsubscribe` / `ping`.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOpResponse {
    pub op: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_topic_payload() {
        let raw = r#"{
            "category": "linear", "symbol": "BTCUSDT", "orderId": "abc", "side": "Buy",
            "orderType": "Market", "stopOrderType": "", "orderStatus": "PartiallyFilled",
            "qty": "0.010", "cumExecQty": "0.004", "cumExecValue": "120", "avgPrice": "30000",
            "closedPnl": "0", "positionIdx": 1, "reduceOnly": false, "updatedTime": "1700000000000"
        }"#;
        let order: OrderData = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_f64(&order.cum_exec_qty), 0.004);
        assert_eq!(parse_order_status(&order.order_status), OrderStatus::PartiallyFilled);
        assert_eq!(position_side_from_idx(order.position_idx), Some(PositionSide::Long));
    }

    #[test]
    fn test_order_type_mapping() {
        assert_eq!(parse_order_type("Market", ""), OrderType::Market);
        assert_eq!(parse_order_type("Market", "Stop"), OrderType::StopMarket);
        assert_eq!(parse_order_type("Market", "TrailingStop"), OrderType::TrailingStop);
        assert_eq!(parse_order_type("Limit", ""), OrderType::Limit);
    }

    #[test]
    fn test_orderbook_levels() {
        let book = OrderbookResult {
            symbol: "BTCUSDT".to_string(),
            bids: vec![("100.5".to_string(), "2".to_string()), ("bad".to_string(), "1".to_string())],
            asks: vec![("101".to_string(), "3".to_string())],
            ts: 0,
        };
        let (bids, asks) = book.parse_levels();
        assert_eq!(bids, vec![(100.5, 2.0)]);
        assert_eq!(asks, vec![(101.0, 3.0)]);
    }

    #[test]
    fn test_blank_numbers_are_zero() {
        assert_eq!(parse_f64(""), 0.0);
        assert_eq!(parse_i64("17"), 17);
    }
}

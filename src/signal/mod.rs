//! Volume-profile signal evaluation.
//!
//! A candle's traded volume is bucketed into equal-width price ranges; the
//! bucket holding the most volume is the point of control (POC). Where the
//! POC sits inside the candle decides direction and strength.

pub mod scanner;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::exchange::{Kline, OrderBookSnapshot, OrderSide, PositionSide, Trade};

pub use scanner::{InstanceResult, SymbolMarketInfo};

/// Number of strength zones the POC position maps onto.
const STRENGTH_ZONES: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalStrength {
    StopStrong,
    StopSlow,
    NoAction,
    PushSlow,
    PushStrong,
    /// Not enough data to classify.
    Unavailable,
}

impl SignalStrength {
    fn from_zone(zone: usize) -> Self {
        match zone {
            0 => SignalStrength::StopStrong,
            1 => SignalStrength::StopSlow,
            2 => SignalStrength::NoAction,
            3 => SignalStrength::PushSlow,
            _ => SignalStrength::PushStrong,
        }
    }

    pub fn side(&self) -> SignalSide {
        match self {
            SignalStrength::StopStrong | SignalStrength::StopSlow => SignalSide::Short,
            SignalStrength::PushSlow | SignalStrength::PushStrong => SignalSide::Long,
            SignalStrength::NoAction => SignalSide::Both,
            SignalStrength::Unavailable => SignalSide::None,
        }
    }

    pub fn is_strong(&self) -> bool {
        matches!(self, SignalStrength::StopStrong | SignalStrength::PushStrong)
    }

    /// Whether this strength satisfies `required`.
    pub fn meets(&self, required: RequiredStrength) -> bool {
        match required {
            RequiredStrength::Any => *self != SignalStrength::Unavailable,
            RequiredStrength::Slow => matches!(
                self,
                SignalStrength::StopSlow
                    | SignalStrength::StopStrong
                    | SignalStrength::PushSlow
                    | SignalStrength::PushStrong
            ),
            RequiredStrength::Strong => self.is_strong(),
        }
    }
}

/// Minimum strength a decision requires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequiredStrength {
    Any,
    #[default]
    Slow,
    Strong,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalSide {
    Long,
    Short,
    /// Neutral POC: either side may be taken.
    Both,
    None,
}

impl SignalSide {
    pub fn allows(&self, side: PositionSide) -> bool {
        match self {
            SignalSide::Long => side == PositionSide::Long,
            SignalSide::Short => side == PositionSide::Short,
            SignalSide::Both => true,
            SignalSide::None => false,
        }
    }

    pub fn position_side(&self) -> Option<PositionSide> {
        match self {
            SignalSide::Long => Some(PositionSide::Long),
            SignalSide::Short => Some(PositionSide::Short),
            SignalSide::Both | SignalSide::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalOptions {
    pub bucket_count: usize,
    /// Fewer distinct trade prices than this yields `Unavailable`.
    pub min_distinct_prices: usize,
    /// Half-width of the order-book window around mid, in percent.
    pub depth_percent: f64,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            bucket_count: 5,
            min_distinct_prices: 5,
            depth_percent: 1.0,
        }
    }
}

/// Taker volume traded at one price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeCluster {
    pub price: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

impl VolumeCluster {
    pub fn total(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }
}

/// Aggregate trades into per-price clusters, lowest price first.
pub fn cluster_trades(trades: &[Trade]) -> Vec<VolumeCluster> {
    let mut by_price: BTreeMap<OrderedFloat<f64>, VolumeCluster> = BTreeMap::new();

    for trade in trades {
        let cluster = by_price
            .entry(OrderedFloat(trade.price))
            .or_insert(VolumeCluster {
                price: trade.price,
                buy_volume: 0.0,
                sell_volume: 0.0,
            });
        match trade.side {
            OrderSide::Buy => cluster.buy_volume += trade.quantity,
            OrderSide::Sell => cluster.sell_volume += trade.quantity,
        }
    }

    by_price.into_values().collect()
}

/// Resting volume near the mid price.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthSummary {
    pub bid_volume: f64,
    pub ask_volume: f64,
}

impl DepthSummary {
    /// Sum book levels within `percent` of the mid price.
    pub fn from_book(book: &OrderBookSnapshot, percent: f64) -> Self {
        let best_bid = book.bids.first().map(|(p, _)| *p);
        let best_ask = book.asks.first().map(|(p, _)| *p);
        let mid = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => (bid + ask) / 2.0,
            (Some(bid), None) => bid,
            (None, Some(ask)) => ask,
            (None, None) => return Self::default(),
        };

        let window = mid * percent / 100.0;
        let bid_volume = book
            .bids
            .iter()
            .filter(|(price, _)| *price >= mid - window)
            .map(|(_, qty)| qty)
            .sum();
        let ask_volume = book
            .asks
            .iter()
            .filter(|(price, _)| *price <= mid + window)
            .map(|(_, qty)| qty)
            .sum();

        Self { bid_volume, ask_volume }
    }

    /// (bid - ask) / (bid + ask), in [-1, 1].
    pub fn imbalance(&self) -> f64 {
        let total = self.bid_volume + self.ask_volume;
        if total == 0.0 {
            return 0.0;
        }
        (self.bid_volume - self.ask_volume) / total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub side: SignalSide,
    pub strength: SignalStrength,
    /// Zero-based POC bucket, lowest price first.
    pub poc_bucket: Option<usize>,
    pub poc_price: f64,
    /// POC inside the open-close body rather than a wick.
    pub poc_in_body: bool,
    pub bullish: bool,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub depth: DepthSummary,
}

impl Signal {
    pub fn unavailable(symbol: &str, depth: DepthSummary) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: SignalSide::None,
            strength: SignalStrength::Unavailable,
            poc_bucket: None,
            poc_price: 0.0,
            poc_in_body: false,
            bullish: false,
            buy_volume: 0.0,
            sell_volume: 0.0,
            depth,
        }
    }

    pub fn is_available(&self) -> bool {
        self.strength != SignalStrength::Unavailable
    }
}

/// Classify one candle. Pure: identical inputs give identical signals.
pub fn evaluate(
    symbol: &str,
    kline: &Kline,
    clusters: &[VolumeCluster],
    book: &OrderBookSnapshot,
    options: &SignalOptions,
) -> Signal {
    let depth = DepthSummary::from_book(book, options.depth_percent);
    let bucket_count = options.bucket_count.max(1);
    let range = kline.high - kline.low;

    let in_range: Vec<&VolumeCluster> = clusters
        .iter()
        .filter(|c| c.price >= kline.low && c.price <= kline.high && c.total() > 0.0)
        .collect();

    if range <= 0.0 || in_range.len() < options.min_distinct_prices.max(bucket_count) {
        return Signal::unavailable(symbol, depth);
    }

    let width = range / bucket_count as f64;
    let mut buckets = vec![0.0_f64; bucket_count];
    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;

    for cluster in &in_range {
        let index = (((cluster.price - kline.low) / width) as usize).min(bucket_count - 1);
        buckets[index] += cluster.total();
        buy_volume += cluster.buy_volume;
        sell_volume += cluster.sell_volume;
    }

    // First maximum wins on ties
    let mut poc = 0;
    for (index, volume) in buckets.iter().enumerate() {
        if *volume > buckets[poc] {
            poc = index;
        }
    }

    let zone = ((poc as f64 + 0.5) * STRENGTH_ZONES as f64 / bucket_count as f64) as usize;
    let strength = SignalStrength::from_zone(zone.min(STRENGTH_ZONES - 1));
    let poc_price = kline.low + width * (poc as f64 + 0.5);
    let poc_in_body = poc_price >= kline.body_low() && poc_price <= kline.body_high();

    Signal {
        symbol: symbol.to_string(),
        side: strength.side(),
        strength,
        poc_bucket: Some(poc),
        poc_price,
        poc_in_body,
        bullish: kline.is_bullish(),
        buy_volume,
        sell_volume,
        depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 299_999,
            open,
            high: 110.0,
            low: 100.0,
            close,
            volume: 1000.0,
            quote_volume: 105_000.0,
        }
    }

    /// One cluster in each of five buckets, with `heavy` carrying the most volume.
    fn clusters(heavy: usize) -> Vec<VolumeCluster> {
        (0..5)
            .map(|i| VolumeCluster {
                price: 101.0 + 2.0 * i as f64,
                buy_volume: if i == heavy { 50.0 } else { 5.0 },
                sell_volume: 1.0,
            })
            .collect()
    }

    fn book() -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            bids: vec![(105.0, 10.0), (104.5, 5.0), (90.0, 100.0)],
            asks: vec![(105.5, 4.0), (106.0, 2.0), (120.0, 100.0)],
            timestamp: 0,
        }
    }

    #[test]
    fn test_poc_top_bucket_on_bullish_candle_is_push_strong() {
        let signal = evaluate("BTCUSDT", &kline(101.0, 109.0), &clusters(4), &book(), &SignalOptions::default());

        assert_eq!(signal.strength, SignalStrength::PushStrong);
        assert_eq!(signal.side, SignalSide::Long);
        assert_eq!(signal.poc_bucket, Some(4));
        assert!(signal.bullish);
    }

    #[test]
    fn test_bucket_mapping() {
        let expected = [
            (0, SignalStrength::StopStrong, SignalSide::Short),
            (1, SignalStrength::StopSlow, SignalSide::Short),
            (2, SignalStrength::NoAction, SignalSide::Both),
            (3, SignalStrength::PushSlow, SignalSide::Long),
            (4, SignalStrength::PushStrong, SignalSide::Long),
        ];
        for (heavy, strength, side) in expected {
            let signal = evaluate("X", &kline(101.0, 109.0), &clusters(heavy), &book(), &SignalOptions::default());
            assert_eq!(signal.strength, strength, "bucket {}", heavy);
            assert_eq!(signal.side, side, "bucket {}", heavy);
        }
    }

    #[test]
    fn test_ten_buckets_map_onto_five_zones() {
        let options = SignalOptions {
            bucket_count: 10,
            min_distinct_prices: 5,
            ..SignalOptions::default()
        };
        let mut data: Vec<VolumeCluster> = (0..10)
            .map(|i| VolumeCluster {
                price: 100.5 + i as f64,
                buy_volume: 1.0,
                sell_volume: 0.0,
            })
            .collect();
        data[1].buy_volume = 40.0;

        let signal = evaluate("X", &kline(101.0, 109.0), &data, &book(), &options);
        assert_eq!(signal.poc_bucket, Some(1));
        assert_eq!(signal.strength, SignalStrength::StopStrong);
    }

    #[test]
    fn test_too_few_prices_is_unavailable() {
        let few = &clusters(4)[..3];
        let signal = evaluate("X", &kline(101.0, 109.0), few, &book(), &SignalOptions::default());

        assert_eq!(signal.strength, SignalStrength::Unavailable);
        assert_eq!(signal.side, SignalSide::None);
        assert!(!signal.is_available());
    }

    #[test]
    fn test_flat_candle_is_unavailable() {
        let mut flat = kline(100.0, 100.0);
        flat.high = 100.0;
        let signal = evaluate("X", &flat, &clusters(0), &book(), &SignalOptions::default());
        assert!(!signal.is_available());
    }

    #[test]
    fn test_poc_in_wick() {
        // Body 104..106, POC at the top bucket (109) sits in the upper wick
        let signal = evaluate("X", &kline(104.0, 106.0), &clusters(4), &book(), &SignalOptions::default());
        assert!(!signal.poc_in_body);

        let signal = evaluate("X", &kline(104.0, 106.0), &clusters(2), &book(), &SignalOptions::default());
        assert!(signal.poc_in_body);
    }

    #[test]
    fn test_evaluation_is_pure() {
        let k = kline(101.0, 109.0);
        let c = clusters(3);
        let b = book();
        let options = SignalOptions::default();
        assert_eq!(evaluate("X", &k, &c, &b, &options), evaluate("X", &k, &c, &b, &options));
    }

    #[test]
    fn test_cluster_trades_aggregates_by_price() {
        let trades = vec![
            Trade { price: 10.0, quantity: 1.0, side: OrderSide::Buy, time: 1 },
            Trade { price: 10.0, quantity: 2.0, side: OrderSide::Sell, time: 2 },
            Trade { price: 9.5, quantity: 3.0, side: OrderSide::Buy, time: 3 },
        ];
        let clusters = cluster_trades(&trades);

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].price, 9.5);
        assert_eq!(clusters[1].buy_volume, 1.0);
        assert_eq!(clusters[1].sell_volume, 2.0);
    }

    #[test]
    fn test_depth_window() {
        let depth = DepthSummary::from_book(&book(), 1.0);
        // mid 105.25, window ±1.0525
        assert_eq!(depth.bid_volume, 15.0);
        assert_eq!(depth.ask_volume, 6.0);
        assert!(depth.imbalance() > 0.0);
    }

    #[test]
    fn test_required_strength() {
        assert!(SignalStrength::PushStrong.meets(RequiredStrength::Strong));
        assert!(!SignalStrength::PushSlow.meets(RequiredStrength::Strong));
        assert!(SignalStrength::StopSlow.meets(RequiredStrength::Slow));
        assert!(!SignalStrength::NoAction.meets(RequiredStrength::Slow));
        assert!(SignalStrength::NoAction.meets(RequiredStrength::Any));
        assert!(!SignalStrength::Unavailable.meets(RequiredStrength::Any));
    }
}

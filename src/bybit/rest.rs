//! Bybit v5 REST client for USDT linear perpetuals (hedge mode).

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::form_urlencoded;

use crate::error::{ExchangeError, ExchangeErrorKind};
use crate::exchange::{
    Balance, ExchangeClient, ExchangePosition, ExchangeResult, HistoricalOrder, Kline, MarginType, OrderAck,
    OrderBookSnapshot, OrderKind, OrderRequest, PositionSide, SymbolFilters, Ticker24h, Trade,
};

use super::auth::BybitAuth;
use super::types::*;

const CATEGORY: &str = "linear";
const TRADES_LIMIT: usize = 1000;
/// Local code for a trade window the API could not cover.
const TRUNCATED_TRADES_CODE: i64 = -2;
const ORDER_HISTORY_MAX: usize = 50;
const INSTRUMENTS_PAGE: usize = 1000;

/// Classify a non-zero `retCode`.
pub fn classify_error(code: i64, message: &str) -> ExchangeErrorKind {
    match code {
        110090 | 110013 => ExchangeErrorKind::MaxLeverageExceeded,
        110094 => ExchangeErrorKind::MinNotional,
        // leverage / margin mode already at the requested value
        110043 | 110026 => ExchangeErrorKind::NotModified,
        _ if message.contains("not modified") => ExchangeErrorKind::NotModified,
        _ => ExchangeErrorKind::Other,
    }
}

/// Shortest decimal rendering, as the API expects.
fn decimal(value: f64) -> String {
    value.to_string()
}

/// Keep the trades inside `[start_ms, end_ms]`.
///
/// `recent-trade` only serves the newest `limit` trades. A full page whose
/// oldest trade is still after `start_ms` means the window was cut short,
/// and that is reported as an error instead of a partial candle.
fn trades_in_window(raw: &[PublicTrade], start_ms: i64, end_ms: i64, limit: usize) -> ExchangeResult<Vec<Trade>> {
    let oldest = raw.iter().map(|t| parse_i64(&t.time)).min();
    if let Some(oldest) = oldest {
        if raw.len() >= limit && oldest > start_ms {
            return Err(ExchangeError::new(
                TRUNCATED_TRADES_CODE,
                format!("recent trades reach back to {} only, window starts at {}", oldest, start_ms),
                ExchangeErrorKind::Other,
            ));
        }
    }

    Ok(raw
        .iter()
        .filter_map(|t| {
            let time = parse_i64(&t.time);
            if time < start_ms || time > end_ms {
                return None;
            }
            Some(Trade {
                price: parse_f64(&t.price),
                quantity: parse_f64(&t.size),
                side: parse_side(&t.side)?,
                time,
            })
        })
        .collect())
}

pub struct BybitClient {
    client: Client,
    auth: Option<BybitAuth>,
    rest_url: String,
    recv_window: u64,
}

impl BybitClient {
    pub fn new(rest_url: String, auth: Option<BybitAuth>, recv_window: u64) -> ExchangeResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            auth,
            rest_url,
            recv_window,
        })
    }

    fn unwrap_envelope(response: RestResponse) -> ExchangeResult<Value> {
        if response.ret_code != 0 {
            let kind = classify_error(response.ret_code, &response.ret_msg);
            return Err(ExchangeError::new(response.ret_code, response.ret_msg, kind));
        }
        Ok(response.result)
    }

    async fn get(&self, path: &str, params: &[(&str, String)], signed: bool) -> ExchangeResult<Value> {
        let query: String = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();
        let url = format!("{}{}?{}", self.rest_url, path, query);

        let mut request = self.client.get(&url);
        if signed {
            let auth = self.require_auth()?;
            let timestamp = chrono::Utc::now().timestamp_millis();
            let sign = auth.generate_signature(timestamp, self.recv_window, &query);
            request = request
                .header("X-BAPI-API-KEY", auth.get_api_key())
                .header("X-BAPI-SIGN", sign)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string());
        }

        let response: RestResponse = request.send().await?.json().await?;
        Self::unwrap_envelope(response)
    }

    async fn post(&self, path: &str, body: Value) -> ExchangeResult<Value> {
        let auth = self.require_auth()?;
        let url = format!("{}{}", self.rest_url, path);
        let body_str = body.to_string();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let sign = auth.generate_signature(timestamp, self.recv_window, &body_str);

        let response: RestResponse = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", auth.get_api_key())
            .header("X-BAPI-SIGN", sign)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string())
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await?
            .json()
            .await?;
        Self::unwrap_envelope(response)
    }

    /// `Ok` also when the exchange reports the setting as unchanged.
    async fn post_setting(&self, path: &str, body: Value) -> ExchangeResult<()> {
        match self.post(path, body).await {
            Ok(_) => Ok(()),
            Err(e) if e.is(ExchangeErrorKind::NotModified) => {
                debug!("{}: {}", path, e.message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn require_auth(&self) -> ExchangeResult<&BybitAuth> {
        self.auth
            .as_ref()
            .ok_or_else(|| ExchangeError::new(-1, "API credentials not configured", ExchangeErrorKind::Other))
    }

    fn list<T: DeserializeOwned>(result: &Value) -> ExchangeResult<Vec<T>> {
        Ok(serde_json::from_value(result["list"].clone())?)
    }

    async fn place_trailing_stop(&self, request: &OrderRequest, activation_price: f64, callback_rate: f64) -> ExchangeResult<OrderAck> {
        let price_str = decimal(activation_price);
        let decimals = price_str.split('.').nth(1).map_or(0, str::len);
        let distance = activation_price * callback_rate / 100.0;

        self.post(
            "/v5/position/trading-stop",
            json!({
                "category": CATEGORY,
                "symbol": request.symbol,
                "tpslMode": "Full",
                "positionIdx": position_idx(request.position_side),
                "trailingStop": format!("{:.*}", decimals, distance),
                "activePrice": price_str,
            }),
        )
        .await?;

        Ok(OrderAck {
            order_id: format!("trailing-{}-{}", request.symbol, request.position_side),
            symbol: request.symbol.clone(),
        })
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    async fn get_klines(&self, symbol: &str, interval_minutes: u32, start_ms: i64, end_ms: i64) -> ExchangeResult<Vec<Kline>> {
        let result = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval_minutes.to_string()),
                    ("start", start_ms.to_string()),
                    ("end", end_ms.to_string()),
                    ("limit", crate::exchange::KLINE_PAGE_LIMIT.to_string()),
                ],
                false,
            )
            .await?;

        let rows: Vec<Vec<String>> = Self::list(&result)?;
        let interval_ms = i64::from(interval_minutes.max(1)) * 60_000;
        let mut klines: Vec<Kline> = rows
            .iter()
            .filter(|row| row.len() >= 7)
            .map(|row| {
                let open_time = parse_i64(&row[0]);
                Kline {
                    open_time,
                    close_time: open_time + interval_ms - 1,
                    open: parse_f64(&row[1]),
                    high: parse_f64(&row[2]),
                    low: parse_f64(&row[3]),
                    close: parse_f64(&row[4]),
                    volume: parse_f64(&row[5]),
                    quote_volume: parse_f64(&row[6]),
                }
            })
            .collect();
        // Newest first on the wire
        klines.sort_by_key(|k| k.open_time);
        Ok(klines)
    }

    async fn get_order_book(&self, symbol: &str, limit: usize) -> ExchangeResult<OrderBookSnapshot> {
        let result = self
            .get(
                "/v5/market/orderbook",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;

        let book: OrderbookResult = serde_json::from_value(result)?;
        let (bids, asks) = book.parse_levels();
        Ok(OrderBookSnapshot {
            symbol: book.symbol,
            bids,
            asks,
            timestamp: book.ts,
        })
    }

    async fn get_trades(&self, symbol: &str, start_ms: i64, end_ms: i64) -> ExchangeResult<Vec<Trade>> {
        let result = self
            .get(
                "/v5/market/recent-trade",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", TRADES_LIMIT.to_string()),
                ],
                false,
            )
            .await?;

        let trades: Vec<PublicTrade> = Self::list(&result)?;
        trades_in_window(&trades, start_ms, end_ms, TRADES_LIMIT)
    }

    async fn get_tickers(&self) -> ExchangeResult<Vec<Ticker24h>> {
        let result = self
            .get("/v5/market/tickers", &[("category", CATEGORY.to_string())], false)
            .await?;

        let tickers: Vec<TickerInfo> = Self::list(&result)?;
        Ok(tickers
            .into_iter()
            .map(|t| Ticker24h {
                last_price: parse_f64(&t.last_price),
                quote_volume: parse_f64(&t.turnover24h),
                volume: parse_f64(&t.volume24h),
                symbol: t.symbol,
            })
            .collect())
    }

    async fn get_symbol_filters(&self) -> ExchangeResult<Vec<SymbolFilters>> {
        let mut filters = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut params = vec![
                ("category", CATEGORY.to_string()),
                ("limit", INSTRUMENTS_PAGE.to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.clone()));
            }
            let result = self.get("/v5/market/instruments-info", &params, false).await?;

            let instruments: Vec<InstrumentInfo> = Self::list(&result)?;
            filters.extend(
                instruments
                    .into_iter()
                    .filter(|i| i.status == "Trading")
                    .map(|i| SymbolFilters {
                        tick_size: parse_f64(&i.price_filter.tick_size),
                        step_size: parse_f64(&i.lot_size_filter.qty_step),
                        min_quantity: parse_f64(&i.lot_size_filter.min_order_qty),
                        min_notional: parse_f64(&i.lot_size_filter.min_notional_value),
                        max_leverage: parse_f64(&i.leverage_filter.max_leverage) as u32,
                        base_asset: i.base_coin,
                        quote_asset: i.quote_coin,
                        symbol: i.symbol,
                    }),
            );

            cursor = result["nextPageCursor"].as_str().unwrap_or_default().to_string();
            if cursor.is_empty() {
                break;
            }
        }

        Ok(filters)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "orderType": "Market",
            "qty": decimal(request.quantity),
            "positionIdx": position_idx(request.position_side),
            "reduceOnly": request.reduce_only,
        });

        match request.kind {
            OrderKind::Market => {}
            OrderKind::StopMarket { trigger_price } => {
                // Long stops trigger on a fall, short stops on a rise
                let direction = match request.position_side {
                    PositionSide::Long => 2,
                    PositionSide::Short => 1,
                };
                body["triggerPrice"] = json!(decimal(trigger_price));
                body["triggerDirection"] = json!(direction);
                body["triggerBy"] = json!("LastPrice");
                body["closeOnTrigger"] = json!(true);
            }
            OrderKind::TrailingStop {
                activation_price,
                callback_rate,
            } => return self.place_trailing_stop(request, activation_price, callback_rate).await,
        }

        let result = self.post("/v5/order/create", body).await?;
        Ok(OrderAck {
            order_id: result["orderId"].as_str().unwrap_or_default().to_string(),
            symbol: request.symbol.clone(),
        })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        self.post(
            "/v5/order/cancel-all",
            json!({ "category": CATEGORY, "symbol": symbol }),
        )
        .await?;
        Ok(())
    }

    async fn get_orders(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<HistoricalOrder>> {
        let result = self
            .get(
                "/v5/order/history",
                &[
                    ("category", CATEGORY.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", limit.clamp(1, ORDER_HISTORY_MAX).to_string()),
                ],
                true,
            )
            .await?;

        let records: Vec<OrderRecord> = Self::list(&result)?;
        Ok(records
            .into_iter()
            .filter_map(|o| {
                Some(HistoricalOrder {
                    side: parse_side(&o.side)?,
                    position_side: position_side_from_idx(o.position_idx),
                    status: parse_order_status(&o.order_status),
                    average_price: parse_f64(&o.avg_price),
                    quantity: parse_f64(&o.qty),
                    update_time: parse_i64(&o.updated_time),
                    order_id: o.order_id,
                    symbol: o.symbol,
                })
            })
            .collect())
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let result = self
            .get(
                "/v5/position/list",
                &[
                    ("category", CATEGORY.to_string()),
                    ("settleCoin", "USDT".to_string()),
                ],
                true,
            )
            .await?;

        let records: Vec<PositionRecord> = Self::list(&result)?;
        Ok(records
            .into_iter()
            .filter_map(|p| {
                let quantity = parse_f64(&p.size);
                if quantity <= 0.0 {
                    return None;
                }
                let side = position_side_from_idx(p.position_idx).or_else(|| match parse_side(&p.side)? {
                    crate::exchange::OrderSide::Buy => Some(PositionSide::Long),
                    crate::exchange::OrderSide::Sell => Some(PositionSide::Short),
                })?;
                Some(ExchangePosition {
                    side,
                    entry_price: parse_f64(&p.avg_price),
                    quantity,
                    leverage: parse_f64(&p.leverage) as u32,
                    update_time: parse_i64(&p.updated_time),
                    symbol: p.symbol,
                })
            })
            .collect())
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        let result = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;

        let account = &result["list"][0];
        let number = |field: &str| account[field].as_str().map(parse_f64).unwrap_or(0.0);
        Ok(Balance {
            asset: "USDT".to_string(),
            wallet_balance: number("totalWalletBalance"),
            available_balance: number("totalAvailableBalance"),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.post_setting(
            "/v5/position/set-leverage",
            json!({
                "category": CATEGORY,
                "symbol": symbol,
                "buyLeverage": leverage.to_string(),
                "sellLeverage": leverage.to_string(),
            }),
        )
        .await
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: MarginType, leverage: u32) -> ExchangeResult<()> {
        let trade_mode = match margin_type {
            MarginType::Cross => 0,
            MarginType::Isolated => 1,
        };
        self.post_setting(
            "/v5/position/switch-isolated",
            json!({
                "category": CATEGORY,
                "symbol": symbol,
                "tradeMode": trade_mode,
                "buyLeverage": leverage.to_string(),
                "sellLeverage": leverage.to_string(),
            }),
        )
        .await
    }
}

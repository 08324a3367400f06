//! Exchange gateway port.
//!
//! The engine never talks to an exchange directly; it consumes this trait so
//! that the paper gateway, a live client or a test mock can be swapped in.
//! All payloads are typed. Exchange replies arrive wrapped in an
//! [`ApiEnvelope`] and are decoded by [`ApiEnvelope::into_result`] alone; the
//! paper gateway builds envelopes only for the calls it can reject (order
//! placement and leverage).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("exchange returned ret_code={code} ret_msg={message}")]
    Api { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn is_rate_limited(&self) -> bool {
        let text = self.to_string();
        text.contains("429") || text.contains("Too Many Requests") || text.contains("10006")
    }
}

/// Response wrapper used by the exchange for every REST call.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiEnvelope<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(result: T) -> Self {
        Self {
            ret_code: 0,
            ret_msg: "OK".to_string(),
            result: Some(result),
        }
    }

    pub fn into_result(self) -> GatewayResult<T> {
        if self.ret_code != 0 || self.ret_msg != "OK" {
            return Err(GatewayError::Api {
                code: self.ret_code,
                message: self.ret_msg,
            });
        }
        self.result
            .ok_or_else(|| GatewayError::Decode("envelope without result".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
    FillOrKill,
    PostOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    New,
    Untriggered,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    PendingCancel,
    Deactivated,
}

/// Kline interval as the exchange spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Minutes(u32),
    Day,
    Week,
    Month,
}

const MINUTE_INTERVALS: [u32; 10] = [1, 3, 5, 15, 30, 60, 120, 240, 360, 720];

impl Interval {
    /// Seconds covered by one candle.
    pub fn as_secs(&self) -> u64 {
        match self {
            Interval::Minutes(m) => *m as u64 * 60,
            Interval::Day => 86_400,
            Interval::Week => 7 * 86_400,
            Interval::Month => 30 * 86_400,
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D" => Ok(Interval::Day),
            "W" => Ok(Interval::Week),
            "M" => Ok(Interval::Month),
            other => {
                let minutes: u32 = other
                    .parse()
                    .map_err(|_| format!("unsupported interval '{}'", s))?;
                if MINUTE_INTERVALS.contains(&minutes) {
                    Ok(Interval::Minutes(minutes))
                } else {
                    Err(format!("unsupported interval '{}'", s))
                }
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Minutes(m) => write!(f, "{}", m),
            Interval::Day => write!(f, "D"),
            Interval::Week => write!(f, "W"),
            Interval::Month => write!(f, "M"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SymbolFilter {
    /// Only instruments currently open for trading.
    pub trading_only: bool,
    /// Restrict to this quote currency, e.g. "USDT".
    pub quote_currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SymbolInfo {
    pub name: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub status: String,
    pub price_scale: u32,
    pub qty_step: Decimal,
}

/// Raw kline record. Missing prices decode as NaN and are filtered out by
/// the price extractor, not here.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub start_time: i64,
    #[serde(deserialize_with = "f64_or_nan")]
    pub open: f64,
    #[serde(deserialize_with = "f64_or_nan")]
    pub high: f64,
    #[serde(deserialize_with = "f64_or_nan")]
    pub low: f64,
    #[serde(deserialize_with = "f64_or_nan")]
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

fn f64_or_nan<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub position_index: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub position_index: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlacedOrder {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BookSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub side: BookSide,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub levels: Vec<BookLevel>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PublicTrade {
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub time: i64,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn fetch_symbols(&self, filter: &SymbolFilter) -> GatewayResult<Vec<SymbolInfo>>;

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        start_time: i64,
    ) -> GatewayResult<Vec<Candle>>;

    async fn fetch_position(&self, symbol: &str) -> GatewayResult<Vec<PositionInfo>>;

    async fn fetch_active_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>>;

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> GatewayResult<Order>;

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<PlacedOrder>;

    /// Returns the ids of the cancelled orders.
    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<Vec<String>>;

    async fn set_leverage(
        &self,
        symbol: &str,
        buy_leverage: Decimal,
        sell_leverage: Decimal,
    ) -> GatewayResult<()>;

    /// Latest snapshot of the order book feed for `symbol`.
    async fn order_book(&self, symbol: &str) -> GatewayResult<OrderBookSnapshot>;

    async fn fetch_public_trades(&self, symbol: &str, limit: usize)
        -> GatewayResult<Vec<PublicTrade>>;
}

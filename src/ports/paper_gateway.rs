use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::trade::gateway::{
    ApiEnvelope, BookLevel, BookSide, Candle, ExchangeGateway, GatewayError, GatewayResult,
    Interval, Order, OrderBookSnapshot, OrderRequest, OrderStatus, OrderType, PlacedOrder,
    PositionInfo, PublicTrade, Side, SymbolFilter, SymbolInfo,
};

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: f64 = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<f64>().unwrap_or(1.0).clamp(0.0, 1.0),
            Err(_) => 1.0,
        }
    };
}

const PAPER_BOOK_SIZE: Decimal = Decimal::ONE_THOUSAND;
const PRICE_DP: u32 = 8;

#[derive(Debug, Default)]
struct PaperPosition {
    /// Signed: positive long, negative short.
    net: Decimal,
    entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperAccount {
    orders: HashMap<String, Order>,
    positions: HashMap<String, PaperPosition>,
    reduce_only: HashMap<String, bool>,
}

/// Simulated exchange over a recorded `{symbol: [candles]}` dump. Each
/// [`PaperGateway::tick`] reveals one more candle per symbol; fills happen at
/// the latest close.
#[derive(Debug)]
pub struct PaperGateway {
    history: HashMap<String, Vec<Candle>>,
    len: usize,
    cursor: AtomicUsize,
    half_spread: Decimal,
    fill_probability: f64,
    account: Mutex<PaperAccount>,
}

impl PaperGateway {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        warmup: usize,
        half_spread: Decimal,
    ) -> GatewayResult<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            GatewayError::Transport(format!(
                "failed to open price history {}: {}",
                path_ref.display(),
                e
            ))
        })?;
        let history: HashMap<String, Vec<Candle>> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                GatewayError::Decode(format!(
                    "failed to parse price history {}: {}",
                    path_ref.display(),
                    e
                ))
            })?;
        Self::new(history, warmup, half_spread)
    }

    pub fn new(
        history: HashMap<String, Vec<Candle>>,
        warmup: usize,
        half_spread: Decimal,
    ) -> GatewayResult<Self> {
        let len = history.values().map(Vec::len).min().unwrap_or(0);
        if len == 0 {
            return Err(GatewayError::Decode(
                "price history is empty or has a symbol without candles".to_string(),
            ));
        }
        Ok(Self {
            history,
            len,
            cursor: AtomicUsize::new(warmup.clamp(1, len)),
            half_spread,
            fill_probability: *FILLED_PROBABILITY_IN_EMULATION,
            account: Mutex::new(PaperAccount::default()),
        })
    }

    pub fn with_fill_probability(mut self, probability: f64) -> Self {
        self.fill_probability = probability.clamp(0.0, 1.0);
        self
    }

    /// Reveals the next candle and gives resting orders a chance to fill.
    /// Returns false once the history is exhausted.
    pub fn tick(&self) -> bool {
        let cursor = self.cursor.load(AtomicOrdering::SeqCst);
        if cursor >= self.len {
            return false;
        }
        self.cursor.fetch_add(1, AtomicOrdering::SeqCst);
        self.try_fill_resting();
        true
    }

    fn visible<'a>(&'a self, symbol: &str) -> GatewayResult<&'a [Candle]> {
        let series = self
            .history
            .get(symbol)
            .ok_or_else(|| GatewayError::NotFound(format!("symbol {}", symbol)))?;
        let cursor = self.cursor.load(AtomicOrdering::SeqCst).min(series.len());
        Ok(&series[..cursor])
    }

    fn last_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let close = self
            .visible(symbol)?
            .iter()
            .rev()
            .map(|c| c.close)
            .find(|c| c.is_finite())
            .ok_or_else(|| GatewayError::NotFound(format!("no price for {}", symbol)))?;
        Decimal::from_f64(close)
            .map(|d| d.round_dp(PRICE_DP))
            .ok_or_else(|| GatewayError::Decode(format!("unrepresentable price {}", close)))
    }

    fn lock_account(&self) -> std::sync::MutexGuard<'_, PaperAccount> {
        match self.account.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn should_fill(&self) -> bool {
        self.fill_probability >= 1.0 || rand::random::<f64>() < self.fill_probability
    }

    fn try_fill_resting(&self) {
        let mut account = self.lock_account();
        let resting: Vec<String> = account
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::New)
            .map(|o| o.order_id.clone())
            .collect();
        for id in resting {
            if !self.should_fill() {
                continue;
            }
            let Some(order) = account.orders.get(&id).cloned() else {
                continue;
            };
            let price = match order.price {
                Some(p) => p,
                None => match self.last_price(&order.symbol) {
                    Ok(p) => p,
                    Err(_) => continue,
                },
            };
            let reduce_only = account.reduce_only.get(&id).copied().unwrap_or(false);
            let filled = apply_fill(&mut account, &order, price, reduce_only);
            if let Some(entry) = account.orders.get_mut(&id) {
                entry.filled_qty = filled;
                entry.status = OrderStatus::Filled;
            }
        }
    }

    fn respond_to_order(&self, request: &OrderRequest) -> ApiEnvelope<PlacedOrder> {
        if request.qty <= Decimal::ZERO {
            return reject(10001, "qty must be positive");
        }
        let market_price = match self.last_price(&request.symbol) {
            Ok(p) => p,
            Err(_) => return reject(10001, "unknown symbol"),
        };
        let mut account = self.lock_account();
        if request.reduce_only {
            let net = account
                .positions
                .get(&request.symbol)
                .map(|p| p.net)
                .unwrap_or_default();
            let reduces = match request.side {
                Side::Buy => net < Decimal::ZERO,
                Side::Sell => net > Decimal::ZERO,
            };
            if !reduces {
                return reject(110017, "reduce-only order has no position to reduce");
            }
        }

        let order_id = rand::random::<u64>().to_string();
        let mut order = Order {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::New,
            qty: request.qty,
            filled_qty: Decimal::ZERO,
            price: request.price,
        };
        let fill_now = request.order_type == OrderType::Market || self.should_fill();
        if fill_now {
            let price = match request.order_type {
                OrderType::Market => market_price,
                OrderType::Limit => request.price.unwrap_or(market_price),
            };
            order.filled_qty = apply_fill(&mut account, &order, price, request.reduce_only);
            order.status = OrderStatus::Filled;
            log::info!(
                "[PAPER_FILL] symbol={}, side={:?}, qty={}, price={}",
                order.symbol,
                order.side,
                order.filled_qty,
                price
            );
        }
        account
            .reduce_only
            .insert(order_id.clone(), request.reduce_only);
        account.orders.insert(order_id.clone(), order);
        ApiEnvelope::ok(PlacedOrder { order_id })
    }
}

fn reject<T>(code: i64, message: &str) -> ApiEnvelope<T> {
    ApiEnvelope {
        ret_code: code,
        ret_msg: message.to_string(),
        result: None,
    }
}

/// Books a fill into the position and returns the quantity actually filled.
fn apply_fill(
    account: &mut PaperAccount,
    order: &Order,
    price: Decimal,
    reduce_only: bool,
) -> Decimal {
    let position = account.positions.entry(order.symbol.clone()).or_default();
    let mut qty = order.qty;
    if reduce_only {
        qty = qty.min(position.net.abs());
    }
    let signed = match order.side {
        Side::Buy => qty,
        Side::Sell => -qty,
    };
    let next = position.net + signed;
    let grows =
        position.net.is_zero() || position.net.is_sign_positive() == signed.is_sign_positive();
    if grows && !next.is_zero() {
        position.entry_price =
            ((position.entry_price * position.net.abs()) + price * qty) / next.abs();
    } else if next.is_zero() {
        position.entry_price = Decimal::ZERO;
    } else if next.is_sign_positive() != position.net.is_sign_positive() {
        // flipped through zero
        position.entry_price = price;
    }
    position.net = next;
    qty
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn fetch_symbols(&self, filter: &SymbolFilter) -> GatewayResult<Vec<SymbolInfo>> {
        let quote = filter.quote_currency.as_deref().unwrap_or("USDT");
        let mut symbols: Vec<SymbolInfo> = self
            .history
            .keys()
            .filter(|name| name.ends_with(quote))
            .map(|name| SymbolInfo {
                name: name.clone(),
                base_currency: name.trim_end_matches(quote).to_string(),
                quote_currency: quote.to_string(),
                status: "Trading".to_string(),
                price_scale: 4,
                qty_step: Decimal::new(1, 3),
            })
            .collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(symbols)
    }

    /// `start_time` is ignored: the replay clock is the cursor.
    async fn fetch_candles(
        &self,
        symbol: &str,
        _interval: Interval,
        limit: usize,
        _start_time: i64,
    ) -> GatewayResult<Vec<Candle>> {
        let visible = self.visible(symbol)?;
        let skip = visible.len().saturating_sub(limit);
        Ok(visible[skip..].to_vec())
    }

    async fn fetch_position(&self, symbol: &str) -> GatewayResult<Vec<PositionInfo>> {
        let account = self.lock_account();
        let positions = account
            .positions
            .get(symbol)
            .filter(|p| !p.net.is_zero())
            .map(|p| PositionInfo {
                symbol: symbol.to_string(),
                entry_price: p.entry_price.round_dp(PRICE_DP),
                size: p.net.abs(),
                side: if p.net.is_sign_positive() {
                    Side::Buy
                } else {
                    Side::Sell
                },
                position_index: 0,
            })
            .into_iter()
            .collect();
        Ok(positions)
    }

    async fn fetch_active_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>> {
        let account = self.lock_account();
        Ok(account
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.status == OrderStatus::New)
            .cloned()
            .collect())
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> GatewayResult<Order> {
        let account = self.lock_account();
        account
            .orders
            .get(order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("order {} on {}", order_id, symbol)))
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<PlacedOrder> {
        self.respond_to_order(request).into_result()
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<Vec<String>> {
        let mut account = self.lock_account();
        let mut cancelled = Vec::new();
        for order in account.orders.values_mut() {
            if order.symbol == symbol && order.status == OrderStatus::New {
                order.status = OrderStatus::Cancelled;
                cancelled.push(order.order_id.clone());
            }
        }
        Ok(cancelled)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        buy_leverage: Decimal,
        sell_leverage: Decimal,
    ) -> GatewayResult<()> {
        if !self.history.contains_key(symbol) {
            return reject::<()>(10001, "unknown symbol").into_result();
        }
        log::debug!(
            "[PAPER] leverage for {} set to buy={} sell={}",
            symbol,
            buy_leverage,
            sell_leverage
        );
        Ok(())
    }

    async fn order_book(&self, symbol: &str) -> GatewayResult<OrderBookSnapshot> {
        let mid = self.last_price(symbol)?;
        let bid = (mid * (Decimal::ONE - self.half_spread)).round_dp(PRICE_DP);
        let ask = (mid * (Decimal::ONE + self.half_spread)).round_dp(PRICE_DP);
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            levels: vec![
                BookLevel {
                    price: bid,
                    size: PAPER_BOOK_SIZE,
                    side: BookSide::Buy,
                },
                BookLevel {
                    price: ask,
                    size: PAPER_BOOK_SIZE,
                    side: BookSide::Sell,
                },
            ],
        })
    }

    async fn fetch_public_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> GatewayResult<Vec<PublicTrade>> {
        let visible = self.visible(symbol)?;
        let skip = visible.len().saturating_sub(limit);
        Ok(visible[skip..]
            .iter()
            .filter_map(|c| {
                Some(PublicTrade {
                    price: Decimal::from_f64(c.close)?.round_dp(PRICE_DP),
                    size: Decimal::from_f64(c.volume)?.round_dp(PRICE_DP),
                    side: if c.close >= c.open { Side::Buy } else { Side::Sell },
                    time: c.start_time,
                })
            })
            .collect())
    }
}

impl PaperGateway {
    /// Unrealised PnL of all positions at the latest close.
    pub fn unrealised_pnl(&self) -> Decimal {
        let account = self.lock_account();
        account
            .positions
            .iter()
            .filter_map(|(symbol, p)| {
                let price = self.last_price(symbol).ok()?;
                Some((price - p.entry_price) * p.net)
            })
            .sum()
    }

    pub fn remaining(&self) -> usize {
        self.len - self.cursor.load(AtomicOrdering::SeqCst).min(self.len)
    }
}

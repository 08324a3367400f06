//! Canned-response gateway for engine and wrapper tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::analysis::prices::candles_from_closes;
use crate::trade::gateway::{
    Candle, ExchangeGateway, GatewayError, GatewayResult, Interval, Order, OrderBookSnapshot,
    OrderRequest, OrderStatus, OrderType, PlacedOrder, PositionInfo, PublicTrade, Side,
    SymbolFilter, SymbolInfo,
};
use crate::trade::sizing::book;

/// What happens to a stored order when its symbol's orders are cancelled.
pub(crate) enum CancelEffect {
    /// The exchange settled the order before the cancel landed.
    Settle(Order),
    /// The order can no longer be read.
    Forget(String),
}

#[derive(Default)]
pub(crate) struct MockGateway {
    pub fail_all: AtomicBool,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub positions: Mutex<HashMap<String, Vec<PositionInfo>>>,
    pub active: Mutex<HashMap<String, Vec<Order>>>,
    pub orders: Mutex<HashMap<String, Order>>,
    pub books: Mutex<HashMap<String, OrderBookSnapshot>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub leverage_calls: Mutex<Vec<(String, Decimal, Decimal)>>,
    pub rejected: Mutex<HashSet<String>>,
    pub unreadable_positions: Mutex<HashSet<String>>,
    pub cancel_effects: Mutex<HashMap<String, CancelEffect>>,
    next_id: AtomicUsize,
}

impl MockGateway {
    fn check(&self) -> GatewayResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport(
                "HTTP 429 Too Many Requests".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_closes(&self, symbol: &str, closes: &[f64]) {
        self.candles
            .lock()
            .unwrap()
            .insert(symbol.to_string(), candles_from_closes(closes));
    }

    pub fn set_position(&self, symbol: &str, side: Side, size: Decimal) {
        let info = PositionInfo {
            symbol: symbol.to_string(),
            entry_price: Decimal::ONE_HUNDRED,
            size,
            side,
            position_index: 0,
        };
        self.positions
            .lock()
            .unwrap()
            .insert(symbol.to_string(), vec![info]);
    }

    pub fn set_book(&self, symbol: &str, bids: &[&str], asks: &[&str]) {
        self.books
            .lock()
            .unwrap()
            .insert(symbol.to_string(), book(symbol, bids, asks));
    }

    pub fn set_order(&self, order: Order) {
        self.orders
            .lock()
            .unwrap()
            .insert(order.order_id.clone(), order);
    }

    pub fn set_order_status(&self, symbol: &str, order_id: &str, status: OrderStatus) {
        self.set_order(Order {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            status,
            qty: Decimal::ONE,
            filled_qty: Decimal::ZERO,
            price: Some(Decimal::ONE_HUNDRED),
        });
    }

    pub fn set_active_orders(&self, symbol: &str, orders: Vec<Order>) {
        self.active
            .lock()
            .unwrap()
            .insert(symbol.to_string(), orders);
    }

    pub fn on_cancel(&self, symbol: &str, effect: CancelEffect) {
        self.cancel_effects
            .lock()
            .unwrap()
            .insert(symbol.to_string(), effect);
    }

    pub fn reject_symbol(&self, symbol: &str) {
        self.rejected.lock().unwrap().insert(symbol.to_string());
    }

    pub fn hide_positions(&self, symbol: &str) {
        self.unreadable_positions
            .lock()
            .unwrap()
            .insert(symbol.to_string());
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn fetch_symbols(&self, _filter: &SymbolFilter) -> GatewayResult<Vec<SymbolInfo>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        _interval: Interval,
        limit: usize,
        _start_time: i64,
    ) -> GatewayResult<Vec<Candle>> {
        self.check()?;
        let candles = self.candles.lock().unwrap();
        let series = candles
            .get(symbol)
            .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))?;
        let skip = series.len().saturating_sub(limit);
        Ok(series[skip..].to_vec())
    }

    async fn fetch_position(&self, symbol: &str) -> GatewayResult<Vec<PositionInfo>> {
        self.check()?;
        if self.unreadable_positions.lock().unwrap().contains(symbol) {
            return Err(GatewayError::Transport("connection reset".to_string()));
        }
        Ok(self
            .positions
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_active_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>> {
        self.check()?;
        Ok(self
            .active
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> GatewayResult<Order> {
        self.check()?;
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<PlacedOrder> {
        self.check()?;
        if self.rejected.lock().unwrap().contains(&request.symbol) {
            return Err(GatewayError::Api {
                code: 10001,
                message: "order rejected".to_string(),
            });
        }
        let id = format!("order-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.placed.lock().unwrap().push(request.clone());
        self.set_order(Order {
            order_id: id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            status: OrderStatus::New,
            qty: request.qty,
            filled_qty: Decimal::ZERO,
            price: request.price,
        });
        Ok(PlacedOrder { order_id: id })
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<Vec<String>> {
        self.check()?;
        self.cancelled.lock().unwrap().push(symbol.to_string());
        match self.cancel_effects.lock().unwrap().remove(symbol) {
            Some(CancelEffect::Settle(order)) => self.set_order(order),
            Some(CancelEffect::Forget(order_id)) => {
                self.orders.lock().unwrap().remove(&order_id);
            }
            None => {}
        }
        let ids = self
            .active
            .lock()
            .unwrap()
            .remove(symbol)
            .unwrap_or_default()
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        Ok(ids)
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        buy_leverage: Decimal,
        sell_leverage: Decimal,
    ) -> GatewayResult<()> {
        self.check()?;
        self.leverage_calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), buy_leverage, sell_leverage));
        Ok(())
    }

    async fn order_book(&self, symbol: &str) -> GatewayResult<OrderBookSnapshot> {
        self.check()?;
        self.books
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(symbol.to_string()))
    }

    async fn fetch_public_trades(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> GatewayResult<Vec<PublicTrade>> {
        self.check()?;
        Ok(Vec::new())
    }
}

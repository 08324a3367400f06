use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::rate_limit_notifier::notify_rate_limit;
use crate::trade::gateway::{
    Candle, ExchangeGateway, GatewayError, GatewayResult, Interval, Order, OrderBookSnapshot,
    OrderRequest, PlacedOrder, PositionInfo, PublicTrade, SymbolFilter, SymbolInfo,
};

/// Wraps a gateway so that a failed call is logged once here and handed to
/// the engine as a sentinel (`None`, empty, `false`) instead of an error.
pub struct GatewayBox {
    pub inner: Arc<dyn ExchangeGateway>,
}

impl GatewayBox {
    pub fn new(inner: Arc<dyn ExchangeGateway>) -> Self {
        Self { inner }
    }

    fn report_rate_limit(&self, operation: &str, detail: &str, err: &GatewayError) {
        if err.is_rate_limited() {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err.to_string());
        }
    }

    fn degrade<T>(operation: &str, detail: &str, result: GatewayResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("[GATEWAY] {} failed for {}: {}", operation, detail, err);
                None
            }
        }
    }

    pub async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        start_time: i64,
    ) -> Option<Vec<Candle>> {
        let result = self.fetch_candles(symbol, interval, limit, start_time).await;
        Self::degrade("fetch_candles", symbol, result)
    }

    /// `None` means "unknown", never "flat".
    pub async fn positions(&self, symbol: &str) -> Option<Vec<PositionInfo>> {
        let result = self.fetch_position(symbol).await;
        Self::degrade("fetch_position", symbol, result)
    }

    pub async fn active_orders(&self, symbol: &str) -> Option<Vec<Order>> {
        let result = self.fetch_active_orders(symbol).await;
        Self::degrade("fetch_active_orders", symbol, result)
    }

    pub async fn order(&self, symbol: &str, order_id: &str) -> Option<Order> {
        let result = self.fetch_order(symbol, order_id).await;
        Self::degrade("fetch_order", &format!("{} | order_id={}", symbol, order_id), result)
    }

    /// Order id of the accepted order; rejections and blank ids are `None`.
    pub async fn place(&self, request: &OrderRequest) -> Option<String> {
        let detail = format!(
            "{} | side={:?} qty={} reduce_only={}",
            request.symbol, request.side, request.qty, request.reduce_only
        );
        let placed = Self::degrade("place_order", &detail, self.place_order(request).await)?;
        if placed.order_id.trim().is_empty() {
            log::warn!("[GATEWAY] place_order for {} returned a blank order id", detail);
            return None;
        }
        Some(placed.order_id)
    }

    pub async fn cancel_all(&self, symbol: &str) -> Vec<String> {
        let result = self.cancel_all_orders(symbol).await;
        Self::degrade("cancel_all_orders", symbol, result).unwrap_or_default()
    }

    pub async fn apply_leverage(&self, symbol: &str, leverage: Decimal) -> bool {
        let result = self.set_leverage(symbol, leverage, leverage).await;
        Self::degrade("set_leverage", symbol, result).is_some()
    }

    pub async fn book(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        let result = self.order_book(symbol).await;
        Self::degrade("order_book", symbol, result)
    }

    pub async fn recent_trades(&self, symbol: &str, limit: usize) -> Vec<PublicTrade> {
        let result = self.fetch_public_trades(symbol, limit).await;
        Self::degrade("fetch_public_trades", symbol, result).unwrap_or_default()
    }

    pub async fn symbols(&self, filter: &SymbolFilter) -> Vec<SymbolInfo> {
        let result = self.fetch_symbols(filter).await;
        Self::degrade("fetch_symbols", "all", result).unwrap_or_default()
    }
}

#[async_trait]
impl ExchangeGateway for GatewayBox {
    async fn fetch_symbols(&self, filter: &SymbolFilter) -> GatewayResult<Vec<SymbolInfo>> {
        let result = self.inner.fetch_symbols(filter).await;
        if let Err(ref err) = result {
            self.report_rate_limit("fetch_symbols", "all", err);
        }
        result
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
        start_time: i64,
    ) -> GatewayResult<Vec<Candle>> {
        let result = self
            .inner
            .fetch_candles(symbol, interval, limit, start_time)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "fetch_candles",
                &format!("{} | interval={} limit={}", symbol, interval, limit),
                err,
            );
        }
        result
    }

    async fn fetch_position(&self, symbol: &str) -> GatewayResult<Vec<PositionInfo>> {
        let result = self.inner.fetch_position(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("fetch_position", symbol, err);
        }
        result
    }

    async fn fetch_active_orders(&self, symbol: &str) -> GatewayResult<Vec<Order>> {
        let result = self.inner.fetch_active_orders(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("fetch_active_orders", symbol, err);
        }
        result
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> GatewayResult<Order> {
        let result = self.inner.fetch_order(symbol, order_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "fetch_order",
                &format!("{} | order_id={}", symbol, order_id),
                err,
            );
        }
        result
    }

    async fn place_order(&self, request: &OrderRequest) -> GatewayResult<PlacedOrder> {
        let result = self.inner.place_order(request).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "place_order",
                &format!(
                    "{} | side={:?} qty={}",
                    request.symbol, request.side, request.qty
                ),
                err,
            );
        }
        result
    }

    async fn cancel_all_orders(&self, symbol: &str) -> GatewayResult<Vec<String>> {
        let result = self.inner.cancel_all_orders(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("cancel_all_orders", symbol, err);
        }
        result
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        buy_leverage: Decimal,
        sell_leverage: Decimal,
    ) -> GatewayResult<()> {
        let result = self
            .inner
            .set_leverage(symbol, buy_leverage, sell_leverage)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "set_leverage",
                &format!("{} | buy={} sell={}", symbol, buy_leverage, sell_leverage),
                err,
            );
        }
        result
    }

    async fn order_book(&self, symbol: &str) -> GatewayResult<OrderBookSnapshot> {
        let result = self.inner.order_book(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("order_book", symbol, err);
        }
        result
    }

    async fn fetch_public_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> GatewayResult<Vec<PublicTrade>> {
        let result = self.inner.fetch_public_trades(symbol, limit).await;
        if let Err(ref err) = result {
            self.report_rate_limit("fetch_public_trades", symbol, err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::gateway::{OrderType, Side, TimeInForce};
    use crate::trade::mock_gateway::MockGateway;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn request(symbol: &str) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            qty: dec!(1),
            price: None,
            stop_loss: None,
            time_in_force: TimeInForce::GoodTillCancel,
            reduce_only: false,
            position_index: 0,
        }
    }

    #[tokio::test]
    async fn failures_degrade_to_sentinels() {
        let mock = Arc::new(MockGateway::default());
        mock.fail_all.store(true, Ordering::SeqCst);
        let gateway = GatewayBox::new(mock);

        assert!(gateway
            .candles("AAA", Interval::Minutes(60), 10, 0)
            .await
            .is_none());
        assert!(gateway.positions("AAA").await.is_none());
        assert!(gateway.active_orders("AAA").await.is_none());
        assert!(gateway.order("AAA", "1").await.is_none());
        assert!(gateway.place(&request("AAA")).await.is_none());
        assert!(gateway.cancel_all("AAA").await.is_empty());
        assert!(!gateway.apply_leverage("AAA", dec!(1)).await);
        assert!(gateway.book("AAA").await.is_none());
        assert!(gateway.recent_trades("AAA", 5).await.is_empty());
        assert!(gateway.symbols(&SymbolFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn place_returns_id_and_rejection_is_none() {
        let mock = Arc::new(MockGateway::default());
        mock.reject_symbol("BBB");
        let gateway = GatewayBox::new(mock.clone());

        let id = gateway.place(&request("AAA")).await;
        assert!(id.is_some());
        assert!(gateway.place(&request("BBB")).await.is_none());
        assert_eq!(mock.placed().len(), 1);
    }

    #[tokio::test]
    async fn leverage_is_forwarded_for_both_sides() {
        let mock = Arc::new(MockGateway::default());
        let gateway = GatewayBox::new(mock.clone());
        assert!(gateway.apply_leverage("AAA", dec!(2)).await);
        let calls = mock.leverage_calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("AAA".to_string(), dec!(2), dec!(2))]);
    }
}

use serde::Serialize;
use std::fmt;

use crate::trade::execution::gateway_box::GatewayBox;
use crate::trade::gateway::{Order, OrderStatus};

/// What the engine should do about one tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderCheck {
    PositionFilled,
    OrderActive,
    PartialFill,
    TryAgain,
    /// The order could not be fetched; wait for the next tick.
    Unknown,
}

impl OrderCheck {
    pub fn from_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Filled => OrderCheck::PositionFilled,
            OrderStatus::Created | OrderStatus::New | OrderStatus::Untriggered => {
                OrderCheck::OrderActive
            }
            OrderStatus::PartiallyFilled => OrderCheck::PartialFill,
            OrderStatus::Cancelled
            | OrderStatus::Rejected
            | OrderStatus::PendingCancel
            | OrderStatus::Deactivated => OrderCheck::TryAgain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderCheck::PositionFilled => "Position filled",
            OrderCheck::OrderActive => "Order active",
            OrderCheck::PartialFill => "Partial fill",
            OrderCheck::TryAgain => "Try again",
            OrderCheck::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for OrderCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fetches the order and classifies it, keeping the order for callers that
/// need its filled quantity.
pub async fn inspect_order(
    gateway: &GatewayBox,
    symbol: &str,
    order_id: &str,
) -> (OrderCheck, Option<Order>) {
    match gateway.order(symbol, order_id).await {
        Some(order) => (OrderCheck::from_status(order.status), Some(order)),
        None => (OrderCheck::Unknown, None),
    }
}

pub async fn check_order(gateway: &GatewayBox, symbol: &str, order_id: &str) -> OrderCheck {
    inspect_order(gateway, symbol, order_id).await.0
}

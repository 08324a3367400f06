use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trade::gateway::{BookSide, OrderBookSnapshot, PublicTrade, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn order_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }
}

/// Decimal places the exchange accepts for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolPrecision {
    pub price_decimals: u32,
    pub quantity_decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeDetails {
    pub symbol: String,
    pub order_price: Decimal,
    pub stop_loss: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    #[error("order book for {0} is empty")]
    EmptyOrderBook(String),
    #[error("order book for {symbol} has no {missing} levels")]
    OneSidedBook { symbol: String, missing: &'static str },
}

/// Best bid (max of bids) and best ask (min of asks).
pub fn best_bid_ask(snapshot: &OrderBookSnapshot) -> Result<(Decimal, Decimal), SizingError> {
    if snapshot.levels.is_empty() {
        return Err(SizingError::EmptyOrderBook(snapshot.symbol.clone()));
    }
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    for level in &snapshot.levels {
        match level.side {
            BookSide::Buy => bids.push(level.price),
            BookSide::Sell => asks.push(level.price),
        }
    }
    let best_bid = bids.into_iter().max().ok_or_else(|| SizingError::OneSidedBook {
        symbol: snapshot.symbol.clone(),
        missing: "bid",
    })?;
    let best_ask = asks.into_iter().min().ok_or_else(|| SizingError::OneSidedBook {
        symbol: snapshot.symbol.clone(),
        missing: "ask",
    })?;
    Ok((best_bid, best_ask))
}

pub fn mid_price(snapshot: &OrderBookSnapshot) -> Option<Decimal> {
    let (bid, ask) = best_bid_ask(snapshot).ok()?;
    Some((bid + ask) / Decimal::TWO)
}

/// Resting order at the near touch: best bid for longs, best ask for shorts,
/// with a symmetric percentage stop.
pub fn try_build_order(
    snapshot: &OrderBookSnapshot,
    direction: Direction,
    capital: Decimal,
    precision: SymbolPrecision,
    stop_loss_fraction: Decimal,
) -> Result<TradeDetails, SizingError> {
    let (best_bid, best_ask) = best_bid_ask(snapshot)?;
    let (raw_price, stop_factor) = match direction {
        Direction::Long => (best_bid, Decimal::ONE - stop_loss_fraction),
        Direction::Short => (best_ask, Decimal::ONE + stop_loss_fraction),
    };
    let order_price = raw_price.round_dp(precision.price_decimals);
    let stop_loss = (raw_price * stop_factor).round_dp(precision.price_decimals);
    // divide at full precision, round once
    let quantity = if capital > Decimal::ZERO && raw_price > Decimal::ZERO {
        (capital / raw_price).round_dp(precision.quantity_decimals)
    } else {
        Decimal::ZERO
    };
    Ok(TradeDetails {
        symbol: snapshot.symbol.clone(),
        order_price,
        stop_loss,
        quantity,
    })
}

pub fn build_order(
    snapshot: &OrderBookSnapshot,
    direction: Direction,
    capital: Decimal,
    precision: SymbolPrecision,
    stop_loss_fraction: Decimal,
) -> Option<TradeDetails> {
    match try_build_order(snapshot, direction, capital, precision, stop_loss_fraction) {
        Ok(details) => Some(details),
        Err(err) => {
            log::debug!("[SIZING] no order: {}", err);
            None
        }
    }
}

/// Mean size of recent public trades, a rough liquidity gauge.
pub fn average_trade_size(trades: &[PublicTrade]) -> Option<Decimal> {
    if trades.is_empty() {
        return None;
    }
    let total: Decimal = trades.iter().map(|t| t.size).sum();
    let count = Decimal::from_usize(trades.len())?;
    Some(total / count)
}

#[cfg(test)]
pub(crate) fn book(symbol: &str, bids: &[&str], asks: &[&str]) -> OrderBookSnapshot {
    use crate::trade::gateway::BookLevel;
    use std::str::FromStr;

    let level = |price: &str, side| BookLevel {
        price: Decimal::from_str(price).unwrap(),
        size: Decimal::ONE,
        side,
    };
    let mut levels: Vec<BookLevel> = bids.iter().map(|p| level(p, BookSide::Buy)).collect();
    levels.extend(asks.iter().map(|p| level(p, BookSide::Sell)));
    OrderBookSnapshot {
        symbol: symbol.to_string(),
        levels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const PRECISION: SymbolPrecision = SymbolPrecision {
        price_decimals: 2,
        quantity_decimals: 3,
    };

    #[test]
    fn direction_maps_to_order_side() {
        assert_eq!(Direction::Long.order_side(), Side::Buy);
        assert_eq!(Direction::Short.order_side(), Side::Sell);
    }

    #[test]
    fn long_rests_at_best_bid() {
        let snapshot = book("BTCUSDT", &["99", "100"], &["101", "102"]);
        let details =
            build_order(&snapshot, Direction::Long, dec!(1000), PRECISION, dec!(0.15)).unwrap();
        assert_eq!(details.symbol, "BTCUSDT");
        assert_eq!(details.order_price, dec!(100));
        assert_eq!(details.stop_loss, dec!(85.00));
        assert_eq!(details.quantity, dec!(10));
    }

    #[test]
    fn short_rests_at_best_ask_with_stop_above() {
        let snapshot = book("ETHUSDT", &["99", "100"], &["102", "101"]);
        let details =
            build_order(&snapshot, Direction::Short, dec!(1000), PRECISION, dec!(0.15)).unwrap();
        assert_eq!(details.order_price, dec!(101));
        assert_eq!(details.stop_loss, dec!(116.15));
        assert_eq!(details.quantity, dec!(9.901));
    }

    #[test]
    fn empty_or_one_sided_book_yields_none() {
        let empty = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            levels: vec![],
        };
        assert!(build_order(&empty, Direction::Long, dec!(1000), PRECISION, dec!(0.1)).is_none());
        let bids_only = book("BTCUSDT", &["100"], &[]);
        assert_eq!(
            try_build_order(&bids_only, Direction::Long, dec!(1000), PRECISION, dec!(0.1)),
            Err(SizingError::OneSidedBook {
                symbol: "BTCUSDT".to_string(),
                missing: "ask"
            })
        );
    }

    #[test]
    fn non_positive_capital_gives_zero_quantity() {
        let snapshot = book("BTCUSDT", &["100"], &["101"]);
        let details =
            build_order(&snapshot, Direction::Long, Decimal::ZERO, PRECISION, dec!(0.1)).unwrap();
        assert_eq!(details.quantity, Decimal::ZERO);
    }

    #[test]
    fn quantity_is_rounded_after_division() {
        // 10 / 3 at full precision then 3dp, not 10 / 3.00 rounded twice
        let snapshot = book("XRPUSDT", &["2.999"], &["3.1"]);
        let precision = SymbolPrecision {
            price_decimals: 2,
            quantity_decimals: 3,
        };
        let details =
            build_order(&snapshot, Direction::Long, dec!(10), precision, dec!(0.1)).unwrap();
        assert_eq!(details.order_price, dec!(3.00));
        assert_eq!(details.quantity, dec!(3.334));
    }

    #[test]
    fn mid_price_and_average_trade_size() {
        let snapshot = book("BTCUSDT", &["100"], &["102"]);
        assert_eq!(mid_price(&snapshot), Some(dec!(101)));
        let trades = vec![
            PublicTrade {
                price: dec!(100),
                size: dec!(2),
                side: Side::Buy,
                time: 1,
            },
            PublicTrade {
                price: dec!(100),
                size: dec!(4),
                side: Side::Sell,
                time: 2,
            },
        ];
        assert_eq!(average_trade_size(&trades), Some(dec!(3)));
        assert_eq!(average_trade_size(&[]), None);
    }
}

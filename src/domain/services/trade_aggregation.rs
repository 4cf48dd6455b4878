//! Close price / realized PnL resolution for externally closed positions.

use crate::domain::entities::market::Trade;
use crate::domain::entities::order::PositionSide;
use serde::Serialize;

/// Below this magnitude a reported realized PnL is treated as missing
pub const PNL_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillAggregate {
    pub order_id: String,
    pub avg_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub last_timestamp_ms: i64,
}

/// Quantity-weighted aggregate of every fill belonging to `order_id`
pub fn aggregate_order_fills(order_id: &str, trades: &[Trade]) -> Option<FillAggregate> {
    let fills: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.order_id == order_id && t.quantity > 0.0 && t.price > 0.0)
        .collect();
    if fills.is_empty() {
        return None;
    }

    let quantity: f64 = fills.iter().map(|t| t.quantity).sum();
    let notional: f64 = fills.iter().map(|t| t.price * t.quantity).sum();
    let fee_currency = fills
        .iter()
        .find(|t| !t.fee_currency.is_empty())
        .map(|t| t.fee_currency.clone())
        .unwrap_or_default();

    Some(FillAggregate {
        order_id: order_id.to_string(),
        avg_price: notional / quantity,
        quantity,
        realized_pnl: fills.iter().map(|t| t.realized_pnl).sum(),
        fee: fills.iter().map(|t| t.fee.abs()).sum(),
        fee_currency,
        last_timestamp_ms: fills.iter().map(|t| t.timestamp_ms).max().unwrap_or_default(),
    })
}

pub fn realized_pnl(side: PositionSide, open_price: f64, close_price: f64, quantity: f64) -> f64 {
    match side {
        PositionSide::Long => (close_price - open_price) * quantity.abs(),
        PositionSide::Short => (open_price - close_price) * quantity.abs(),
    }
}

/// The open leg being resolved
#[derive(Debug, Clone, PartialEq)]
pub struct OpenLeg {
    pub side: PositionSide,
    pub open_price: f64,
    pub quantity: f64,
    pub open_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseSource {
    TradeHistory,
    Ticker,
    LastKnownPrice,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseResolution {
    pub close_price: f64,
    pub realized_pnl: f64,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub close_order_id: Option<String>,
    pub close_time_ms: i64,
    pub source: CloseSource,
}

/// Resolves a close from trade history.
///
/// Uses `close_order_id` when its fills are present, otherwise the most recent
/// closing-side fill at or after the open time.
pub fn resolve_close_from_trades(
    leg: &OpenLeg,
    trades: &[Trade],
    close_order_id: Option<&str>,
) -> Option<CloseResolution> {
    let closing_side = leg.side.closing_side();
    let candidates: Vec<Trade> = trades
        .iter()
        .filter(|t| t.side == closing_side)
        .filter(|t| t.position_side.map_or(true, |p| p == leg.side))
        .filter(|t| leg.open_time_ms <= 0 || t.timestamp_ms >= leg.open_time_ms)
        .cloned()
        .collect();

    let order_id = close_order_id
        .filter(|id| candidates.iter().any(|t| t.order_id == *id))
        .map(str::to_string)
        .or_else(|| {
            candidates
                .iter()
                .max_by_key(|t| t.timestamp_ms)
                .map(|t| t.order_id.clone())
        })?;

    let aggregate = aggregate_order_fills(&order_id, &candidates)?;
    let pnl = if aggregate.realized_pnl.abs() < PNL_EPSILON {
        realized_pnl(leg.side, leg.open_price, aggregate.avg_price, leg.quantity)
    } else {
        aggregate.realized_pnl
    };

    Some(CloseResolution {
        close_price: aggregate.avg_price,
        realized_pnl: pnl,
        fee: Some(aggregate.fee),
        fee_currency: Some(aggregate.fee_currency).filter(|c| !c.is_empty()),
        close_order_id: Some(aggregate.order_id),
        close_time_ms: aggregate.last_timestamp_ms,
        source: CloseSource::TradeHistory,
    })
}

/// Price-based estimate when no fills are obtainable
pub fn estimate_close_from_price(
    leg: &OpenLeg,
    price: f64,
    now_ms: i64,
    source: CloseSource,
) -> CloseResolution {
    CloseResolution {
        close_price: price,
        realized_pnl: realized_pnl(leg.side, leg.open_price, price, leg.quantity),
        fee: None,
        fee_currency: None,
        close_order_id: None,
        close_time_ms: now_ms,
        source,
    }
}

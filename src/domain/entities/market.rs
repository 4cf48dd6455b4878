//! Exchange-reported market and account state, in venue-independent form.

use crate::domain::entities::order::{OrderSide, PositionSide};
use serde::{Deserialize, Serialize};

/// Position sizes at or below this magnitude are treated as flat
pub const POSITION_EPSILON: f64 = 1e-9;

/// Converts second-resolution timestamps to milliseconds; millisecond values pass through.
pub fn normalize_timestamp_ms(value: i64) -> i64 {
    if value > 0 && value < 1_000_000_000_000 {
        value * 1000
    } else {
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub available: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub mark_price: Option<f64>,
    pub timestamp_ms: i64,
}

impl Ticker {
    /// Mark price when the venue publishes one, otherwise the last trade price
    pub fn effective_mark_price(&self) -> f64 {
        self.mark_price
            .filter(|p| *p > 0.0)
            .unwrap_or(self.last_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size
    pub amount: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub margin: f64,
    pub margin_mode: String,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.amount.abs() > POSITION_EPSILON
    }

    /// Margin committed to the position; derived from notional when the venue omits it
    pub fn effective_margin(&self, fallback_leverage: f64) -> f64 {
        if self.margin > 0.0 {
            return self.margin;
        }
        let leverage = if self.leverage > 0.0 {
            self.leverage
        } else if fallback_leverage > 0.0 {
            fallback_leverage
        } else {
            1.0
        };
        self.amount.abs() * self.entry_price / leverage
    }
}

/// Order as reported by an exchange, normalized across venues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Option<PositionSide>,
    pub order_type: String,
    pub reduce_only: bool,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_price: f64,
    pub raw_status: String,
    /// Binance vocabulary: NEW, PARTIALLY_FILLED, FILLED, CANCELED, ...
    pub status: String,
    pub is_open: bool,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

impl ExchangeOrder {
    pub fn has_fill(&self) -> bool {
        self.filled_quantity > POSITION_EPSILON
            && matches!(self.status.as_str(), "FILLED" | "PARTIALLY_FILLED")
    }

    pub fn is_terminal_without_fill(&self) -> bool {
        self.filled_quantity <= POSITION_EPSILON
            && matches!(
                self.status.as_str(),
                "CANCELED" | "REJECTED" | "EXPIRED" | "FAILED"
            )
    }

    /// Leg this order acts on
    pub fn leg(&self) -> PositionSide {
        self.position_side
            .unwrap_or_else(|| PositionSide::infer(self.side, self.reduce_only))
    }

    /// True when the order grows `leg` rather than reducing it
    pub fn opens(&self, leg: PositionSide) -> bool {
        !self.reduce_only && self.side == leg.opening_side() && self.leg() == leg
    }

    pub fn fill_price(&self) -> f64 {
        if self.avg_price > 0.0 {
            self.avg_price
        } else {
            self.price
        }
    }
}

/// One executed fill from trade history or a private stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: Option<String>,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Option<PositionSide>,
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub timestamp_ms: i64,
}

impl Trade {
    /// Deterministic id for venues that do not publish one, so refetching the
    /// same history window maps onto the same rows.
    pub fn synthetic_trade_id(&self) -> String {
        format!(
            "{}-{}-{:.8}-{:.8}-{}",
            self.order_id,
            self.timestamp_ms,
            self.price,
            self.quantity,
            self.side.as_str()
        )
    }

    pub fn resolved_trade_id(&self) -> String {
        match &self.trade_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => self.synthetic_trade_id(),
        }
    }
}

use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(ValidationError::InvalidOrderSide(other.to_string())),
        }
    }
}

/// Hedge-mode leg. A robot holds at most one open position per leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub const BOTH: [PositionSide; 2] = [PositionSide::Long, PositionSide::Short];

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// Order side that grows this leg
    pub fn opening_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that flattens this leg
    pub fn closing_side(&self) -> OrderSide {
        self.opening_side().opposite()
    }

    /// One-way mode reports a signed amount instead of a leg
    pub fn from_signed_amount(amount: f64) -> PositionSide {
        if amount < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }

    /// Leg affected by an order when the venue omits the position side
    pub fn infer(side: OrderSide, reduce_only: bool) -> PositionSide {
        match (side, reduce_only) {
            (OrderSide::Buy, false) | (OrderSide::Sell, true) => PositionSide::Long,
            (OrderSide::Sell, false) | (OrderSide::Buy, true) => PositionSide::Short,
        }
    }

    /// Parses venue vocabulary; `BOTH`/`NET` and blanks yield `None`.
    pub fn parse_venue(raw: &str) -> Option<PositionSide> {
        match raw.trim().to_uppercase().as_str() {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PositionSide::parse_venue(s).ok_or_else(|| ValidationError::InvalidPositionSide(s.to_string()))
    }
}

/// Lifecycle of a ledger row.
///
/// `Pending -> Open -> Closed`, or `Pending -> Failed | Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerStatus {
    Pending,
    Open,
    Closed,
    Failed,
    Canceled,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "PENDING",
            LedgerStatus::Open => "OPEN",
            LedgerStatus::Closed => "CLOSED",
            LedgerStatus::Failed => "FAILED",
            LedgerStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerStatus::Closed | LedgerStatus::Failed | LedgerStatus::Canceled
        )
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(LedgerStatus::Pending),
            "OPEN" => Ok(LedgerStatus::Open),
            "CLOSED" => Ok(LedgerStatus::Closed),
            "FAILED" => Ok(LedgerStatus::Failed),
            "CANCELED" | "CANCELLED" => Ok(LedgerStatus::Canceled),
            other => Err(ValidationError::UnknownLedgerStatus(other.to_string())),
        }
    }
}

/// Where a ledger row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSource {
    Engine,
    Stream,
    OrderHistory,
    PositionSnapshot,
}

impl LedgerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerSource::Engine => "engine",
            LedgerSource::Stream => "stream",
            LedgerSource::OrderHistory => "order_history",
            LedgerSource::PositionSnapshot => "position_snapshot",
        }
    }
}

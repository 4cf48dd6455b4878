//! Exchange Client Trait
//!
//! This module defines the `ExchangeClient` trait, the only way the core talks
//! to an exchange's REST API. Venue adapters (signing, endpoints, payload
//! formats) live outside this crate and are plugged in through
//! [`crate::infrastructure::exchange_client_factory::ExchangeClientFactory`].
//!
//! Trade history is an optional capability: callers ask for it through
//! [`ExchangeClient::trade_history`] instead of assuming every venue has it.

use crate::domain::entities::market::{Balance, ExchangeOrder, Position, Ticker, Trade};
use crate::domain::entities::order::{OrderSide, PositionSide};
use crate::domain::entities::platform::Platform;
use async_trait::async_trait;
use thiserror::Error;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Exchange error: {0}")]
    ExchangeSpecific(String),
}

impl ExchangeError {
    /// Transient faults resolve on their own and are retried on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimited(_))
    }
}

/// Order submission parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub client_order_id: String,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market_open(
        symbol: &str,
        position_side: PositionSide,
        quantity: f64,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: position_side.opening_side(),
            position_side,
            order_type: "MARKET".to_string(),
            quantity,
            price: None,
            client_order_id,
            reduce_only: false,
        }
    }
}

/// Exchange client trait providing common interface for all exchanges
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// Futures account balance in the settlement currency
    async fn get_balance(&self) -> ExchangeResult<Balance>;

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Open positions for `symbol`, both legs
    async fn get_positions(&self, symbol: &str) -> ExchangeResult<Vec<Position>>;

    /// Resting (unfilled or partially filled) orders
    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>>;

    /// Recent orders, newest first, any status
    async fn get_order_history(&self, symbol: &str, limit: usize)
        -> ExchangeResult<Vec<ExchangeOrder>>;

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Market-close `quantity` of the given leg
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<ExchangeOrder>;

    /// Trade history capability, when the venue adapter provides it
    fn trade_history(&self) -> Option<&dyn TradeHistoryProvider> {
        None
    }
}

/// Optional capability: per-fill trade history
#[async_trait]
pub trait TradeHistoryProvider: Send + Sync {
    /// Recent fills for `symbol`, any order
    async fn get_trade_history(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(!ExchangeError::Authentication("bad key".into()).is_transient());
        assert!(!ExchangeError::Unsupported("trade history".into()).is_transient());
    }

    #[test]
    fn test_market_open_request() {
        let request =
            OrderRequest::market_open("BTCUSDT", PositionSide::Short, 0.5, "c-1".to_string());
        assert_eq!(request.side, OrderSide::Sell);
        assert!(!request.reduce_only);
        assert_eq!(request.order_type, "MARKET");
    }
}

//! Rate-limited wrapper around a venue client.
//!
//! One limiter per credential: every robot sharing the credential draws from
//! the same budget.

use crate::domain::entities::market::{Balance, ExchangeOrder, Position, Ticker, Trade};
use crate::domain::entities::order::PositionSide;
use crate::domain::entities::platform::Platform;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangeResult, OrderRequest, TradeHistoryProvider,
};
use crate::rate_limit::ExchangeRateLimiter;
use async_trait::async_trait;
use std::sync::Arc;

pub struct ThrottledExchangeClient {
    inner: Arc<dyn ExchangeClient>,
    limiter: ExchangeRateLimiter,
}

impl ThrottledExchangeClient {
    pub fn new(inner: Arc<dyn ExchangeClient>, limiter: ExchangeRateLimiter) -> Self {
        Self { inner, limiter }
    }

    async fn permit(&self) {
        self.limiter.until_ready().await;
    }
}

#[async_trait]
impl ExchangeClient for ThrottledExchangeClient {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        self.permit().await;
        self.inner.get_balance().await
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.permit().await;
        self.inner.get_ticker(symbol).await
    }

    async fn get_positions(&self, symbol: &str) -> ExchangeResult<Vec<Position>> {
        self.permit().await;
        self.inner.get_positions(symbol).await
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.permit().await;
        self.inner.get_open_orders(symbol).await
    }

    async fn get_order_history(
        &self,
        symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.permit().await;
        self.inner.get_order_history(symbol, limit).await
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.permit().await;
        self.inner.create_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.permit().await;
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<ExchangeOrder> {
        self.permit().await;
        self.inner.close_position(symbol, side, quantity).await
    }

    fn trade_history(&self) -> Option<&dyn TradeHistoryProvider> {
        self.inner
            .trade_history()
            .map(|_| self as &dyn TradeHistoryProvider)
    }
}

#[async_trait]
impl TradeHistoryProvider for ThrottledExchangeClient {
    async fn get_trade_history(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>> {
        let provider = self.inner.trade_history().ok_or_else(|| {
            ExchangeError::Unsupported(format!("{} has no trade history", self.inner.platform()))
        })?;
        self.permit().await;
        provider.get_trade_history(symbol, limit).await
    }
}

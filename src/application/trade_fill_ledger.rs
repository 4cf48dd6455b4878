//! Trade Fill Ledger
//!
//! Deduplicated store of individual fills. Each fill is attributed to the
//! ledger row whose opening or closing order produced it; when no row matches,
//! the single active robot on the credential is assumed to own it.

use crate::domain::entities::market::Trade;
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::persistence::robot_repository::RobotRepository;
use crate::persistence::trade_fill_repository::TradeFillRepository;
use crate::persistence::DatabaseError;
use super::reconciliation::ReconciliationError;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fills fetched per trade-history request
pub const TRADE_HISTORY_LIMIT: usize = 50;

/// Result of one `upsert` batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillUpsertSummary {
    pub saved: usize,
    /// Fills linked to a specific ledger row
    pub matched: usize,
}

pub struct TradeFillLedger {
    fills: TradeFillRepository,
    robots: Arc<RobotRepository>,
}

impl TradeFillLedger {
    pub fn new(fills: TradeFillRepository, robots: Arc<RobotRepository>) -> Self {
        Self { fills, robots }
    }

    pub fn repository(&self) -> &TradeFillRepository {
        &self.fills
    }

    /// Store `trades` for (credential, platform). Trades without a symbol are
    /// attributed to `symbol`.
    pub async fn upsert(
        &self,
        credential_id: i64,
        platform: Platform,
        symbol: &str,
        trades: &[Trade],
    ) -> Result<FillUpsertSummary, DatabaseError> {
        let mut summary = FillUpsertSummary::default();
        if trades.is_empty() {
            return Ok(summary);
        }

        let mut order_ids: Vec<String> = trades.iter().map(|t| t.order_id.clone()).collect();
        order_ids.sort();
        order_ids.dedup();
        let links = self
            .fills
            .find_order_links(credential_id, platform, &order_ids)
            .await?;

        let fallback_robot = if links.len() < order_ids.len() {
            let robots = self
                .robots
                .robot_ids_for_credential(credential_id, platform)
                .await?;
            match robots.as_slice() {
                [only] => Some(*only),
                _ => None,
            }
        } else {
            None
        };

        for trade in trades {
            let mut trade = trade.clone();
            if trade.symbol.is_empty() {
                trade.symbol = canonical_symbol(symbol);
            }

            let (robot_id, ledger_id) = match links.get(&trade.order_id) {
                Some(link) => {
                    summary.matched += 1;
                    (Some(link.robot_id), Some(link.ledger_id))
                }
                None => (fallback_robot, None),
            };

            match self
                .fills
                .upsert(credential_id, platform, &trade, robot_id, ledger_id)
                .await
            {
                Ok(()) => summary.saved += 1,
                Err(e) => warn!(
                    "Failed to store fill {} for order {}: {}",
                    trade.resolved_trade_id(),
                    trade.order_id,
                    e
                ),
            }
        }

        debug!(
            credential_id,
            platform = %platform,
            "Stored {} fills ({} matched to ledger rows)",
            summary.saved,
            summary.matched
        );
        Ok(summary)
    }

    /// Pull recent trade history and store it. `Ok(None)` when the venue has
    /// no trade-history capability.
    pub async fn fetch_and_store(
        &self,
        client: &dyn ExchangeClient,
        credential_id: i64,
        symbol: &str,
    ) -> Result<Option<Vec<Trade>>, ReconciliationError> {
        let fetched = self
            .fetch_and_store_with_limit(client, credential_id, symbol, TRADE_HISTORY_LIMIT)
            .await?;
        Ok(fetched.map(|(trades, _)| trades))
    }

    pub async fn fetch_and_store_with_limit(
        &self,
        client: &dyn ExchangeClient,
        credential_id: i64,
        symbol: &str,
        limit: usize,
    ) -> Result<Option<(Vec<Trade>, FillUpsertSummary)>, ReconciliationError> {
        let Some(history) = client.trade_history() else {
            return Ok(None);
        };
        let trades = history.get_trade_history(symbol, limit).await?;
        let summary = self
            .upsert(credential_id, client.platform(), symbol, &trades)
            .await?;
        Ok(Some((trades, summary)))
    }
}

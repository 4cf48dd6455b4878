//! Incremental ledger upserts from streamed order events.

use super::{ReconciliationError, ReconciliationService};
use crate::domain::entities::order::LedgerSource;
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::entities::robot::Robot;
use crate::domain::repositories::private_stream::PrivateEvent;
use crate::domain::services::fill_events::parse_fills;
use crate::domain::services::order_events::parse_order_events;
use crate::persistence::models::UpsertOutcome;
use crate::persistence::DatabaseError;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalOutcome {
    pub orders_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub fills_saved: usize,
    pub backfill_scheduled: bool,
}

impl ReconciliationService {
    /// Apply one order event to `exchange_orders`, the ledger and the fill store.
    ///
    /// Safe under duplicated or out-of-order delivery: every write is an
    /// upsert keyed by exchange order id or trade id.
    pub async fn apply_order_event(
        self: &Arc<Self>,
        event: &PrivateEvent,
    ) -> Result<IncrementalOutcome, ReconciliationError> {
        let platform = event.platform;
        let credential_id = event.credential_id;
        let orders = parse_order_events(platform, &event.payload);
        let fills = parse_fills(platform, &event.payload);

        let mut outcome = IncrementalOutcome {
            orders_seen: orders.len(),
            ..Default::default()
        };
        if orders.is_empty() && fills.trades.is_empty() && !fills.needs_backfill {
            return Ok(outcome);
        }

        let robots = self.robots_for_credential(platform, credential_id).await?;

        for order in &orders {
            let symbol = canonical_symbol(&order.symbol);
            let robot = robots.iter().find(|r| canonical_symbol(&r.symbol) == symbol);

            self.exchange_orders
                .upsert(platform, credential_id, robot.map(|r| r.id), order)
                .await?;

            let Some(robot) = robot else {
                debug!(
                    "No robot on {} credential {} trades {}, order {} kept as exchange fact only",
                    platform, credential_id, symbol, order.order_id
                );
                continue;
            };

            let frozen = self.frozen_risk_for(robot).await;
            match self
                .orders
                .upsert_from_exchange(
                    robot.id,
                    credential_id,
                    platform,
                    order,
                    LedgerSource::Stream,
                    Some(frozen),
                )
                .await
            {
                Ok(UpsertOutcome::Inserted(id)) => {
                    outcome.inserted += 1;
                    info!(
                        robot_id = robot.id,
                        "Recorded streamed order {} as ledger row {}",
                        order.order_id,
                        id
                    );
                }
                Ok(UpsertOutcome::Updated(_)) => outcome.updated += 1,
                Ok(UpsertOutcome::Skipped) => outcome.skipped += 1,
                Err(e) => {
                    outcome.failed += 1;
                    error!(
                        robot_id = robot.id,
                        "Failed to upsert streamed order {}: {}",
                        order.order_id,
                        e
                    );
                }
            }
        }

        let fill_symbol = orders
            .first()
            .map(|o| o.symbol.clone())
            .or_else(|| fills.trades.first().map(|t| t.symbol.clone()))
            .unwrap_or_else(|| event.symbol.clone());

        if !fills.trades.is_empty() {
            let summary = self
                .fills
                .upsert(credential_id, platform, &fill_symbol, &fills.trades)
                .await?;
            outcome.fills_saved = summary.saved;
        }

        let unreported_fill =
            fills.trades.is_empty() && orders.iter().any(|o| o.has_fill() && !o.is_open);
        if (fills.needs_backfill || unreported_fill) && !fill_symbol.is_empty() {
            outcome.backfill_scheduled = self
                .schedule_trade_backfill(platform, credential_id, &fill_symbol)
                .await;
        }

        Ok(outcome)
    }

    /// Robots on the credential, memoised for the metadata TTL
    async fn robots_for_credential(
        &self,
        platform: Platform,
        credential_id: i64,
    ) -> Result<Vec<Robot>, DatabaseError> {
        self.robot_meta
            .get_or_try_insert_with((platform, credential_id), || async {
                let ids = self
                    .robots
                    .robot_ids_for_credential(credential_id, platform)
                    .await?;
                let mut robots = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(robot) = self.robots.get(id).await? {
                        robots.push(robot);
                    }
                }
                Ok(robots)
            })
            .await
    }

    /// Forget memoised robot metadata after robots start or stop
    pub async fn invalidate_robot_meta(&self, platform: Platform, credential_id: i64) {
        self.robot_meta.remove(&(platform, credential_id)).await;
    }

    /// Debounced trade-history fetch for (platform, credential, symbol)
    async fn schedule_trade_backfill(
        self: &Arc<Self>,
        platform: Platform,
        credential_id: i64,
        symbol: &str,
    ) -> bool {
        let symbol = canonical_symbol(symbol);
        let service = self.clone();
        let key = (platform, credential_id, symbol.clone());
        self.backfill
            .schedule(key, move || async move {
                service
                    .run_trade_backfill(platform, credential_id, &symbol)
                    .await;
            })
            .await
    }

    async fn run_trade_backfill(&self, platform: Platform, credential_id: i64, symbol: &str) {
        let client = match self.sessions.get(credential_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Trade backfill for credential {} skipped: {}", credential_id, e);
                return;
            }
        };
        match self
            .fills
            .fetch_and_store(client.as_ref(), credential_id, symbol)
            .await
        {
            Ok(Some(trades)) => debug!(
                "Backfilled {} fills for {} {} credential {}",
                trades.len(),
                platform,
                symbol,
                credential_id
            ),
            Ok(None) => debug!("{} has no trade history capability", platform),
            Err(e) => warn!(
                "Trade backfill for {} {} credential {} failed: {}",
                platform, symbol, credential_id, e
            ),
        }
    }
}

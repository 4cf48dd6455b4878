//! Open-orders safety net behind the streaming path.
//!
//! Throttled per robot. Resting orders are upserted as exchange facts. A
//! local open order missing from the snapshot is looked up in order history:
//! a fill promotes its ledger row, anything else marks it `sync_missing`. An
//! empty snapshot must persist for the hold period before it is believed,
//! since some venues briefly return nothing during order-book maintenance.

use super::positions::OrderHistory;
use super::{ReconciliationError, ReconciliationService};
use crate::domain::entities::market::ExchangeOrder;
use crate::domain::entities::order::LedgerSource;
use crate::domain::entities::platform::canonical_symbol;
use crate::domain::entities::robot::Robot;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::persistence::models::UpsertOutcome;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Local open orders the snapshot no longer lists
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct MissingOrders {
    /// Gone without a fill: marked `sync_missing`
    pub marked: u64,
    /// Filled while nobody was listening: ledger row promoted
    pub promoted: u64,
}

impl ReconciliationService {
    /// `Ok(None)` when throttled
    pub(super) async fn sync_open_orders(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        history: &mut OrderHistory,
    ) -> Result<Option<MissingOrders>, ReconciliationError> {
        if !self.open_orders_throttle.check_and_mark(robot.id).await {
            return Ok(None);
        }

        let platform = robot.platform;
        let credential_id = robot.credential_id;
        let symbol = canonical_symbol(&robot.symbol);
        let snapshot: Vec<ExchangeOrder> = client
            .get_open_orders(&robot.symbol)
            .await?
            .into_iter()
            .filter(|o| canonical_symbol(&o.symbol) == symbol)
            .collect();

        let frozen = self.frozen_risk_for(robot).await;
        for order in &snapshot {
            self.exchange_orders
                .upsert(platform, credential_id, Some(robot.id), order)
                .await?;
            if let Err(e) = self
                .orders
                .upsert_from_exchange(
                    robot.id,
                    credential_id,
                    platform,
                    order,
                    LedgerSource::OrderHistory,
                    Some(frozen.clone()),
                )
                .await
            {
                warn!(
                    robot_id = robot.id,
                    "Failed to record resting order {}: {}",
                    order.order_id,
                    e
                );
            }
        }

        let live: HashSet<&str> = snapshot.iter().map(|o| o.order_id.as_str()).collect();
        let local = self
            .exchange_orders
            .list_open(platform, credential_id, &symbol)
            .await?;
        let missing: Vec<_> = local
            .iter()
            .filter(|record| !live.contains(record.exchange_order_id.as_str()))
            .collect();

        {
            let mut empty_since = self.empty_open_orders_since.lock().await;
            if missing.is_empty() || !snapshot.is_empty() {
                empty_since.remove(&robot.id);
            } else {
                let first_seen = *empty_since.entry(robot.id).or_insert_with(Instant::now);
                if first_seen.elapsed() < self.config.open_orders_empty_hold {
                    debug!(
                        robot_id = robot.id,
                        "Empty open-orders snapshot held ({} local open)",
                        missing.len()
                    );
                    return Ok(Some(MissingOrders::default()));
                }
                empty_since.remove(&robot.id);
            }
        }

        if missing.is_empty() {
            return Ok(Some(MissingOrders::default()));
        }

        let history = history.load(client, &robot.symbol).await?;
        let mut outcome = MissingOrders::default();
        let mut gone = Vec::new();
        for record in missing {
            let fill = history
                .iter()
                .find(|o| o.order_id == record.exchange_order_id && o.has_fill());
            let Some(order) = fill else {
                gone.push(record);
                continue;
            };

            self.exchange_orders
                .upsert(platform, credential_id, Some(robot.id), order)
                .await?;
            match self
                .orders
                .upsert_from_exchange(
                    robot.id,
                    credential_id,
                    platform,
                    order,
                    LedgerSource::OrderHistory,
                    Some(frozen.clone()),
                )
                .await?
            {
                UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => {
                    outcome.promoted += 1;
                    info!(
                        robot_id = robot.id,
                        "Order {} filled off-stream, ledger row {} updated",
                        order.order_id,
                        id
                    );
                }
                UpsertOutcome::Skipped => {
                    debug!(robot_id = robot.id, "Filled order {} not recorded", order.order_id)
                }
            }
        }

        if gone.is_empty() {
            return Ok(Some(outcome));
        }
        let ids: Vec<i64> = gone.iter().map(|record| record.id).collect();
        outcome.marked = self.exchange_orders.mark_missing(&ids).await?;
        for record in &gone {
            self.orders
                .cancel_pending_missing(platform, credential_id, &record.exchange_order_id)
                .await?;
        }

        info!(
            robot_id = robot.id,
            "Marked {} open orders missing from the exchange snapshot",
            outcome.marked
        );
        Ok(Some(outcome))
    }
}

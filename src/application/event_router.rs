//! Routes decoded private-stream events to the ledger and the engines.

use super::private_stream_manager::StreamEventSink;
use super::reconciliation::ReconciliationService;
use super::robot_engine::EngineRegistry;
use crate::domain::repositories::private_stream::{PrivateEvent, PrivateEventKind};
use crate::domain::services::position_events::{parse_balance_update, parse_position_update};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EventRouter {
    reconciliation: Arc<ReconciliationService>,
    engines: Arc<EngineRegistry>,
}

impl EventRouter {
    pub fn new(reconciliation: Arc<ReconciliationService>, engines: Arc<EngineRegistry>) -> Self {
        Self {
            reconciliation,
            engines,
        }
    }
}

#[async_trait]
impl StreamEventSink for EventRouter {
    async fn apply_order_event(&self, event: &PrivateEvent) {
        match self.reconciliation.apply_order_event(event).await {
            Ok(outcome) if outcome.orders_seen > 0 || outcome.fills_saved > 0 => debug!(
                platform = %event.platform,
                credential_id = event.credential_id,
                "Order event: {} seen, {} inserted, {} updated, {} fills",
                outcome.orders_seen,
                outcome.inserted,
                outcome.updated,
                outcome.fills_saved
            ),
            Ok(_) => {}
            Err(e) => warn!(
                platform = %event.platform,
                credential_id = event.credential_id,
                "Failed to apply order event: {}",
                e
            ),
        }
    }

    async fn apply_snapshot(&self, robot_ids: &[i64], event: &PrivateEvent) {
        // Account pushes on some venues carry positions alongside balances
        let positions = parse_position_update(event.platform, &event.payload);
        let balance = match event.kind {
            PrivateEventKind::Account => parse_balance_update(event.platform, &event.payload),
            _ => None,
        };
        if positions.is_none() && balance.is_none() {
            return;
        }

        for robot_id in robot_ids {
            let Some(engine) = self.engines.get(*robot_id).await else {
                continue;
            };
            if let Some(update) = &positions {
                engine.apply_position_update(update).await;
            }
            if let Some(balance) = &balance {
                engine.apply_balance(balance.clone()).await;
            }
        }
    }

    async fn trigger_reconcile(&self, robot_id: i64) {
        self.reconciliation.trigger().request(robot_id);
    }
}

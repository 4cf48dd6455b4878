//! Periodic trade-fill sync.
//!
//! Pulls recent trade history for every running robot so fills of legs that
//! stay open, or that happened while no stream was listening, still reach the
//! fill ledger. Robots sharing a (credential, symbol) share one request.

use super::{ReconciliationError, ReconciliationService};
use crate::domain::entities::platform::canonical_symbol;
use crate::domain::entities::robot::RobotStatus;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one fill-sync pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct FillSyncReport {
    pub robots: usize,
    pub requests: usize,
    pub saved: usize,
    /// Venues without trade history
    pub unsupported: usize,
    pub failed: usize,
}

impl ReconciliationService {
    /// Store the latest `trade_fill_sync_limit` fills for each running robot
    pub async fn sync_trade_fills(&self) -> Result<FillSyncReport, ReconciliationError> {
        let robots = self.robots.list_by_status(RobotStatus::Running).await?;
        let mut report = FillSyncReport {
            robots: robots.len(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        for robot in robots {
            if !seen.insert((robot.credential_id, canonical_symbol(&robot.symbol))) {
                continue;
            }
            let client = match self.sessions.get(robot.credential_id).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(robot_id = robot.id, "Trade fill sync skipped, no session: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            report.requests += 1;
            match self
                .fills
                .fetch_and_store_with_limit(
                    client.as_ref(),
                    robot.credential_id,
                    &robot.symbol,
                    self.config.trade_fill_sync_limit,
                )
                .await
            {
                Ok(Some((_, summary))) => report.saved += summary.saved,
                Ok(None) => report.unsupported += 1,
                Err(e) => {
                    warn!(robot_id = robot.id, "Trade fill sync failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.saved > 0 || report.failed > 0 {
            info!(
                "Trade fill sync: {} fills over {} requests ({} failed)",
                report.saved, report.requests, report.failed
            );
        } else {
            debug!("Trade fill sync found nothing for {} robots", report.robots);
        }
        Ok(report)
    }

    pub async fn run_fill_sync(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        let mut ticker = tokio::time::interval(self.config.trade_fill_sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Reconciliation passes already backfill on startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_trade_fills().await {
                        warn!("Trade fill sync pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

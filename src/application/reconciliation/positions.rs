//! Position reconciliation: exchange positions against OPEN ledger rows.

use super::{PassReport, ReconciliationError, ReconciliationService, ORDER_HISTORY_LIMIT, SYNC_CLOSE_REASON};
use crate::domain::entities::market::{ExchangeOrder, Position};
use crate::domain::entities::order::{LedgerSource, LedgerStatus, PositionSide};
use crate::domain::entities::platform::canonical_symbol;
use crate::domain::entities::robot::{MarketState, Robot};
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::position_tracker::{realtime_pnl, FrozenRisk};
use crate::domain::services::trade_aggregation::{
    estimate_close_from_price, resolve_close_from_trades, CloseResolution, CloseSource, OpenLeg,
};
use crate::persistence::models::{CloseUpdate, NewOrder, OrderRecord, UpsertOutcome};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Order history fetched at most once per pass, on first use
#[derive(Default)]
pub(super) struct OrderHistory {
    orders: Option<Vec<ExchangeOrder>>,
}

impl OrderHistory {
    pub(super) async fn load(
        &mut self,
        client: &dyn ExchangeClient,
        symbol: &str,
    ) -> Result<&[ExchangeOrder], ReconciliationError> {
        if self.orders.is_none() {
            let orders = client.get_order_history(symbol, ORDER_HISTORY_LIMIT).await?;
            self.orders = Some(orders);
        }
        Ok(self.orders.as_deref().unwrap_or_default())
    }
}

impl ReconciliationService {
    pub(super) async fn reconcile_positions(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        history: &mut OrderHistory,
        report: &mut PassReport,
    ) -> Result<(), ReconciliationError> {
        let symbol = canonical_symbol(&robot.symbol);
        let positions: Vec<Position> = client
            .get_positions(&robot.symbol)
            .await?
            .into_iter()
            .filter(|p| p.is_open() && canonical_symbol(&p.symbol) == symbol)
            .collect();
        let open_rows = self.orders.open_rows(robot.id).await?;

        for side in PositionSide::BOTH {
            let position = positions.iter().find(|p| p.side == side);
            let row = open_rows.iter().find(|r| r.leg().ok() == Some(side));

            let result = match (row, position) {
                (Some(row), None) => self.close_external(robot, client, row).await.map(|delta| {
                    if let Some(delta) = delta {
                        report.closed += 1;
                        report.realized_delta += delta;
                    }
                }),
                (None, Some(position)) => {
                    self.adopt_external(robot, client, position, history, report)
                        .await
                }
                (Some(row), Some(position)) => {
                    self.refresh_open_row(robot, client, row, position, history, report)
                        .await
                }
                (None, None) => Ok(()),
            };

            match result {
                Err(e) if e.is_data_inconsistency() => error!(
                    robot_id = robot.id,
                    "Skipping {} leg reconciliation: {}",
                    side,
                    e
                ),
                other => other?,
            }
        }

        if let Some(engine) = self.engines.get(robot.id).await {
            let rows = self.orders.open_rows(robot.id).await?;
            engine.apply_reconciliation(&positions, &rows).await;
        }
        Ok(())
    }

    /// The leg is flat on the exchange but OPEN locally: close the row
    async fn close_external(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        row: &OrderRecord,
    ) -> Result<Option<f64>, ReconciliationError> {
        let leg = row.open_leg()?;
        let now = Utc::now();

        let mut resolution = None;
        match self
            .fills
            .fetch_and_store(client, robot.credential_id, &robot.symbol)
            .await
        {
            Ok(Some(trades)) => {
                resolution = resolve_close_from_trades(&leg, &trades, row.close_order_id.as_deref());
            }
            Ok(None) => {}
            Err(e) => warn!(
                robot_id = robot.id,
                "Trade history unavailable for close of order {}: {}",
                row.id,
                e
            ),
        }
        let resolution = match resolution {
            Some(resolution) => resolution,
            None => self.estimate_close(robot, client, row, &leg, now).await,
        };

        let engine = self.engines.get(robot.id).await;
        let highest_profit = match &engine {
            Some(engine) => engine.tracked_highest(leg.side).await,
            None => None,
        };

        let update = CloseUpdate {
            close_price: resolution.close_price,
            close_time: DateTime::from_timestamp_millis(resolution.close_time_ms).unwrap_or(now),
            realized_profit: resolution.realized_pnl,
            close_order_id: resolution.close_order_id.clone(),
            close_fee: resolution.fee,
            close_fee_currency: resolution.fee_currency.clone(),
            close_mark_price: row.mark_price,
            close_reason: SYNC_CLOSE_REASON.to_string(),
            highest_profit,
        };
        let delta = self.orders.close_row(row.id, &update).await?;

        if let Some(engine) = engine {
            engine.clear_tracker(leg.side).await;
        }
        if let Some(delta) = delta {
            info!(
                robot_id = robot.id,
                "Order {} {} closed outside the engine at {:.4} via {:?} (realized {:.4})",
                row.id,
                leg.side,
                resolution.close_price,
                resolution.source,
                delta
            );
        }
        Ok(delta)
    }

    /// Ticker estimate, memoised per symbol; last known price when the ticker fails
    async fn estimate_close(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        row: &OrderRecord,
        leg: &OpenLeg,
        now: DateTime<Utc>,
    ) -> CloseResolution {
        let key = (robot.platform, canonical_symbol(&robot.symbol));
        let ticker = self
            .ticker_cache
            .get_or_try_insert_with(key, || async {
                client
                    .get_ticker(&robot.symbol)
                    .await
                    .map(|t| t.effective_mark_price())
            })
            .await;

        match ticker {
            Ok(price) if price > 0.0 => {
                estimate_close_from_price(leg, price, now.timestamp_millis(), CloseSource::Ticker)
            }
            other => {
                if let Err(e) = other {
                    warn!(robot_id = robot.id, "Ticker fallback failed: {}", e);
                }
                let price = row
                    .mark_price
                    .filter(|p| *p > 0.0)
                    .unwrap_or(leg.open_price);
                estimate_close_from_price(leg, price, now.timestamp_millis(), CloseSource::LastKnownPrice)
            }
        }
    }

    /// A position exists with no OPEN row: adopt it from order history, or
    /// synthesise a row from the snapshot so risk controls see it.
    async fn adopt_external(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        position: &Position,
        history: &mut OrderHistory,
        report: &mut PassReport,
    ) -> Result<(), ReconciliationError> {
        let side = position.side;
        let frozen = self.frozen_risk_for(robot).await;

        let mut candidate = None;
        for order in history.load(client, &robot.symbol).await? {
            if !order.opens(side) || !order.has_fill() {
                continue;
            }
            // Newest first: a settled row for it means the position predates the window
            let known = self
                .orders
                .find_by_exchange_order(robot.platform, robot.credential_id, &order.order_id)
                .await?;
            if known.as_ref().map_or(true, OrderRecord::awaits_fill) {
                candidate = Some(order.clone());
            }
            break;
        }

        if let Some(order) = candidate {
            self.exchange_orders
                .upsert(robot.platform, robot.credential_id, Some(robot.id), &order)
                .await?;
            match self
                .orders
                .upsert_from_exchange(
                    robot.id,
                    robot.credential_id,
                    robot.platform,
                    &order,
                    LedgerSource::OrderHistory,
                    Some(frozen),
                )
                .await?
            {
                UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => {
                    report.adopted += 1;
                    info!(
                        robot_id = robot.id,
                        "Adopted external {} position from order {} (row {})",
                        side,
                        order.order_id,
                        id
                    );
                }
                UpsertOutcome::Skipped => {
                    debug!(robot_id = robot.id, "Order {} not adopted", order.order_id)
                }
            }
            return Ok(());
        }

        let now = Utc::now();
        let quantity = position.amount.abs();
        let price = if position.entry_price > 0.0 {
            position.entry_price
        } else {
            position.mark_price
        };
        let leverage = if position.leverage > 0.0 {
            position.leverage
        } else {
            robot.effective_leverage()
        };
        let row = NewOrder {
            robot_id: robot.id,
            credential_id: robot.credential_id,
            platform: robot.platform,
            symbol: canonical_symbol(&robot.symbol),
            exchange_order_id: None,
            client_order_id: None,
            side: side.opening_side(),
            position_side: side,
            order_type: "MARKET".to_string(),
            price,
            quantity,
            filled_quantity: quantity,
            avg_price: price,
            leverage,
            margin: position.effective_margin(leverage),
            status: LedgerStatus::Open,
            raw_status: None,
            is_open: false,
            exchange_update_time_ms: None,
            source: LedgerSource::PositionSnapshot,
            open_fee: None,
            open_fee_currency: None,
            open_time: Some(now),
            frozen_risk: Some(frozen),
        };

        match self.orders.insert_open(&row).await? {
            Some(id) => {
                report.synthesized += 1;
                warn!(
                    robot_id = robot.id,
                    "Synthesized OPEN {} row {} from position snapshot ({} @ {})",
                    side,
                    id,
                    quantity,
                    price
                );
            }
            None => debug!(robot_id = robot.id, "{} leg claimed concurrently", side),
        }
        Ok(())
    }

    /// Both sides agree: refresh live metrics and backfill missing fill fields
    async fn refresh_open_row(
        &self,
        robot: &Robot,
        client: &dyn ExchangeClient,
        row: &OrderRecord,
        position: &Position,
        history: &mut OrderHistory,
        report: &mut PassReport,
    ) -> Result<(), ReconciliationError> {
        let quantity = position.amount.abs();
        let entry = if row.entry_price() > 0.0 {
            row.entry_price()
        } else {
            position.entry_price
        };
        let mark = position.mark_price;

        if mark > 0.0 {
            let unrealized = if entry > 0.0 {
                realtime_pnl(position.side, entry, mark, quantity)
            } else {
                position.unrealized_pnl
            };
            let highest = row.highest_profit.max(unrealized);
            if self
                .orders
                .update_live_metrics(row.id, mark, unrealized, highest)
                .await?
            {
                report.refreshed += 1;
            }
        }

        if row.avg_price > 0.0 && row.filled_quantity > 0.0 {
            return Ok(());
        }
        let Some(exchange_order_id) = row.exchange_order_id.as_deref() else {
            return Ok(());
        };
        let orders = history.load(client, &robot.symbol).await?;
        if let Some(order) = orders.iter().find(|o| o.order_id == exchange_order_id) {
            if self
                .orders
                .backfill_fill_fields(row.id, order.fill_price(), order.filled_quantity)
                .await?
            {
                report.backfilled += 1;
                debug!(robot_id = robot.id, "Backfilled fill fields on order {}", row.id);
            }
        }
        Ok(())
    }

    /// Risk parameters frozen onto adopted rows
    pub(super) async fn frozen_risk_for(&self, robot: &Robot) -> FrozenRisk {
        let state = match self.engines.get(robot.id).await {
            Some(engine) => engine.market_state().await,
            None => robot.default_market_state,
        };
        frozen_risk_or_fallback(robot, state)
    }
}

fn frozen_risk_or_fallback(robot: &Robot, state: MarketState) -> FrozenRisk {
    match robot.risk_profile.params_for(state) {
        Ok(params) => FrozenRisk::capture(params, state),
        Err(e) => {
            warn!(robot_id = robot.id, "Using fallback risk for adopted leg: {}", e);
            FrozenRisk::fallback(state)
        }
    }
}

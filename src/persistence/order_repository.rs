//! Ledger repository.
//!
//! Every write that can race (stream upsert vs. reconciliation) is a single
//! guarded statement against a uniqueness constraint rather than
//! read-modify-write in application code.

use super::models::{CloseUpdate, NewOrder, OrderRecord, UpsertOutcome};
use super::exchange_order_repository::SYNC_MISSING_STATUS;
use super::{write_error, DatabaseError, DbPool};
use crate::domain::entities::market::{ExchangeOrder, POSITION_EPSILON};
use crate::domain::entities::order::{LedgerSource, LedgerStatus, PositionSide};
use crate::domain::entities::platform::Platform;
use crate::domain::services::position_tracker::FrozenRisk;
use crate::domain::services::trade_aggregation::PNL_EPSILON;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

/// Mark/PnL changes at or below this are not written back
pub const LIVE_METRICS_EPSILON: f64 = 0.01;
/// Average price differences at or below this are not backfilled
pub const AVG_PRICE_EPSILON: f64 = 0.01;
/// Filled quantity differences at or below this are not backfilled
pub const FILLED_QTY_EPSILON: f64 = 0.0001;

/// Ledger status an exchange order maps to, or `None` when it is not an opening leg.
pub fn ledger_status_for(order: &ExchangeOrder) -> Option<LedgerStatus> {
    if !order.opens(order.leg()) {
        return None;
    }
    if order.filled_quantity > POSITION_EPSILON {
        return Some(LedgerStatus::Open);
    }
    if order.is_terminal_without_fill() {
        return Some(match order.status.as_str() {
            "CANCELED" => LedgerStatus::Canceled,
            _ => LedgerStatus::Failed,
        });
    }
    Some(LedgerStatus::Pending)
}

// Shared SET clause for exchange-driven updates. Status promotion to OPEN is
// refused while another OPEN row holds the same (robot, side); terminal rows
// never change status, except a `sync_missing` cancel that turns out to have
// filled. Facts older than the last applied venue update leave the raw status
// and open flag alone; an update time of 0 is treated as unknown.
//   ?1 status  ?2 raw_status  ?3 is_open  ?4 filled  ?5 avg_price
//   ?6 price   ?7 quantity    ?8 open_time  ?9 now  ?10 update_time_ms
const EXCHANGE_UPDATE_SET: &str = r#"
    status = CASE
        WHEN status = 'CANCELED' AND raw_status = 'sync_missing' AND ?1 = 'OPEN' AND NOT EXISTS (
            SELECT 1 FROM orders other
            WHERE other.robot_id = orders.robot_id
              AND other.position_side = orders.position_side
              AND other.status = 'OPEN'
              AND other.id <> orders.id
        ) THEN 'OPEN'
        WHEN status IN ('CLOSED', 'FAILED', 'CANCELED') THEN status
        WHEN status = 'OPEN' THEN status
        WHEN ?1 = 'OPEN' AND EXISTS (
            SELECT 1 FROM orders other
            WHERE other.robot_id = orders.robot_id
              AND other.position_side = orders.position_side
              AND other.status = 'OPEN'
              AND other.id <> orders.id
        ) THEN status
        WHEN ?1 <> 'OPEN' AND ?10 > 0 AND ?10 < COALESCE(exchange_update_time_ms, 0) THEN status
        ELSE ?1
    END,
    raw_status = CASE
        WHEN ?10 > 0 AND ?10 < COALESCE(exchange_update_time_ms, 0) THEN raw_status
        ELSE ?2
    END,
    is_open = CASE
        WHEN ?10 > 0 AND ?10 < COALESCE(exchange_update_time_ms, 0) THEN is_open
        ELSE ?3
    END,
    exchange_update_time_ms = CASE
        WHEN ?10 > COALESCE(exchange_update_time_ms, 0) THEN ?10
        ELSE exchange_update_time_ms
    END,
    filled_quantity = MAX(filled_quantity, ?4),
    avg_price = CASE WHEN ?5 > 0 THEN ?5 ELSE avg_price END,
    price = CASE WHEN price <= 0 AND ?6 > 0 THEN ?6 ELSE price END,
    quantity = CASE WHEN ?7 > 0 THEN ?7 ELSE quantity END,
    open_time = CASE WHEN open_time IS NULL AND ?1 = 'OPEN' THEN ?8 ELSE open_time END,
    updated_at = ?9
"#;

pub struct OrderRepository {
    pool: DbPool,
}

impl OrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a ledger row; unique violations surface as `DatabaseError::UniqueViolation`
    pub async fn insert(&self, order: &NewOrder) -> Result<i64, DatabaseError> {
        let now = Utc::now();
        let frozen = order.frozen_risk.as_ref();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orders (
                robot_id, credential_id, platform, symbol, exchange_order_id, client_order_id,
                side, position_side, order_type, price, quantity, filled_quantity, avg_price,
                leverage, margin, status, raw_status, is_open, source, open_fee, open_fee_currency,
                open_time, stop_loss_percent, auto_start_retreat_percent, profit_retreat_percent,
                margin_percent, market_state, exchange_update_time_ms, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?29)
            RETURNING id
            "#,
        )
        .bind(order.robot_id)
        .bind(order.credential_id)
        .bind(order.platform.name())
        .bind(&order.symbol)
        .bind(&order.exchange_order_id)
        .bind(&order.client_order_id)
        .bind(order.side.as_str())
        .bind(order.position_side.as_str())
        .bind(&order.order_type)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.avg_price)
        .bind(order.leverage)
        .bind(order.margin)
        .bind(order.status.as_str())
        .bind(&order.raw_status)
        .bind(order.is_open)
        .bind(order.source.as_str())
        .bind(order.open_fee)
        .bind(&order.open_fee_currency)
        .bind(order.open_time)
        .bind(frozen.map(|f| f.stop_loss_percent))
        .bind(frozen.map(|f| f.auto_start_retreat_percent))
        .bind(frozen.map(|f| f.profit_retreat_percent))
        .bind(frozen.map(|f| f.margin_percent))
        .bind(frozen.map(|f| f.market_state.as_str()))
        .bind(order.exchange_update_time_ms)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error("Failed to insert order", e))?;

        debug!(
            "Inserted ledger row {} for robot {} ({} {} {})",
            id,
            order.robot_id,
            order.symbol,
            order.position_side,
            order.status
        );
        Ok(id)
    }

    /// Insert an OPEN row unless the side already has one. `None` means skipped.
    pub async fn insert_open(&self, order: &NewOrder) -> Result<Option<i64>, DatabaseError> {
        match self.insert(order).await {
            Ok(id) => Ok(Some(id)),
            Err(DatabaseError::UniqueViolation(msg)) => {
                debug!(
                    "Skipped OPEN row for robot {} {}: {}",
                    order.robot_id, order.position_side, msg
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Incremental upsert of an exchange order into the ledger.
    ///
    /// Update by exchange order id first, then link a PENDING row by client
    /// order id, then insert. An insert rejected by a unique index retries the
    /// update once; if that still matches nothing the side is held by another
    /// OPEN row and the order is skipped.
    pub async fn upsert_from_exchange(
        &self,
        robot_id: i64,
        credential_id: i64,
        platform: Platform,
        order: &ExchangeOrder,
        source: LedgerSource,
        frozen_risk: Option<FrozenRisk>,
    ) -> Result<UpsertOutcome, DatabaseError> {
        let Some(status) = ledger_status_for(order) else {
            return Ok(UpsertOutcome::Skipped);
        };

        if let Some(id) = self
            .update_by_exchange_id(credential_id, platform, order, status)
            .await?
        {
            return Ok(UpsertOutcome::Updated(id));
        }

        if let Some(client_id) = order.client_order_id.as_deref().filter(|c| !c.is_empty()) {
            if let Some(id) = self
                .link_by_client_id(credential_id, platform, client_id, order, status)
                .await?
            {
                return Ok(UpsertOutcome::Updated(id));
            }
        }

        if !matches!(status, LedgerStatus::Open | LedgerStatus::Pending) {
            return Ok(UpsertOutcome::Skipped);
        }

        let mut row =
            NewOrder::from_exchange(robot_id, credential_id, platform, order, status, source);
        row.frozen_risk = frozen_risk;

        match self.insert(&row).await {
            Ok(id) => Ok(UpsertOutcome::Inserted(id)),
            Err(DatabaseError::UniqueViolation(_)) => {
                match self
                    .update_by_exchange_id(credential_id, platform, order, status)
                    .await?
                {
                    Some(id) => Ok(UpsertOutcome::Updated(id)),
                    None => {
                        debug!(
                            "Order {} not recorded: robot {} already has an OPEN {} row",
                            order.order_id,
                            robot_id,
                            order.leg()
                        );
                        Ok(UpsertOutcome::Skipped)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_by_exchange_id(
        &self,
        credential_id: i64,
        platform: Platform,
        order: &ExchangeOrder,
        status: LedgerStatus,
    ) -> Result<Option<i64>, DatabaseError> {
        let sql = format!(
            "UPDATE orders SET {} WHERE platform = ?11 AND credential_id = ?12 AND exchange_order_id = ?13 RETURNING id",
            EXCHANGE_UPDATE_SET
        );
        let ids: Vec<(i64,)> = bind_exchange_update(sqlx::query_as(&sql), order, status)
            .bind(platform.name())
            .bind(credential_id)
            .bind(&order.order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| write_error("Failed to update order by exchange id", e))?;
        Ok(ids.first().map(|(id,)| *id))
    }

    async fn link_by_client_id(
        &self,
        credential_id: i64,
        platform: Platform,
        client_order_id: &str,
        order: &ExchangeOrder,
        status: LedgerStatus,
    ) -> Result<Option<i64>, DatabaseError> {
        let sql = format!(
            "UPDATE orders SET {}, exchange_order_id = ?13 WHERE platform = ?11 AND credential_id = ?12 AND client_order_id = ?14 AND exchange_order_id IS NULL AND status = 'PENDING' RETURNING id",
            EXCHANGE_UPDATE_SET
        );
        let ids: Vec<(i64,)> = bind_exchange_update(sqlx::query_as(&sql), order, status)
            .bind(platform.name())
            .bind(credential_id)
            .bind(&order.order_id)
            .bind(client_order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| write_error("Failed to link order by client id", e))?;
        Ok(ids.first().map(|(id,)| *id))
    }

    /// Attach the exchange's acknowledgement to a PENDING row written before submission
    pub async fn mark_submitted(&self, id: i64, order: &ExchangeOrder) -> Result<(), DatabaseError> {
        let status = ledger_status_for(order).unwrap_or(LedgerStatus::Pending);
        let sql = format!(
            "UPDATE orders SET {}, exchange_order_id = COALESCE(exchange_order_id, ?12) WHERE id = ?11 RETURNING id",
            EXCHANGE_UPDATE_SET
        );
        bind_exchange_update(sqlx::query_as(&sql), order, status)
            .bind(id)
            .bind(&order.order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| write_error("Failed to record order submission", e))?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE orders SET status = 'FAILED', error_message = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'PENDING'",
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to mark order failed", e))?;
        Ok(())
    }

    /// A PENDING row whose exchange order vanished from the open-orders snapshot
    pub async fn cancel_pending_missing(
        &self,
        platform: Platform,
        credential_id: i64,
        exchange_order_id: &str,
    ) -> Result<bool, DatabaseError> {
        let rows = sqlx::query(
            "UPDATE orders SET status = 'CANCELED', raw_status = ?1, is_open = 0, updated_at = ?2 \
             WHERE platform = ?3 AND credential_id = ?4 AND exchange_order_id = ?5 AND status = 'PENDING'",
        )
        .bind(SYNC_MISSING_STATUS)
        .bind(Utc::now())
        .bind(platform.name())
        .bind(credential_id)
        .bind(exchange_order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to cancel missing order", e))?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn get(&self, id: i64) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get order {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get order: {}", e))
            })
    }

    pub async fn find_open(
        &self,
        robot_id: i64,
        side: PositionSide,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE robot_id = ?1 AND position_side = ?2 AND status = 'OPEN' ORDER BY id DESC LIMIT 1",
        )
        .bind(robot_id)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find open order for robot {}: {}", robot_id, e);
            DatabaseError::QueryError(format!("Failed to find open order: {}", e))
        })
    }

    pub async fn open_rows(&self, robot_id: i64) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE robot_id = ?1 AND status = 'OPEN' ORDER BY id",
        )
        .bind(robot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list open orders for robot {}: {}", robot_id, e);
            DatabaseError::QueryError(format!("Failed to list open orders: {}", e))
        })
    }

    pub async fn list_by_robot(&self, robot_id: i64) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE robot_id = ?1 ORDER BY id")
            .bind(robot_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list orders for robot {}: {}", robot_id, e);
                DatabaseError::QueryError(format!("Failed to list orders: {}", e))
            })
    }

    /// OPEN rows synthesised from a position snapshot, awaiting operator review
    pub async fn synthesized_open_rows(&self) -> Result<Vec<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE source = ?1 AND status = 'OPEN' ORDER BY id",
        )
        .bind(LedgerSource::PositionSnapshot.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list synthesized rows: {}", e);
            DatabaseError::QueryError(format!("Failed to list synthesized rows: {}", e))
        })
    }

    pub async fn find_by_exchange_order(
        &self,
        platform: Platform,
        credential_id: i64,
        exchange_order_id: &str,
    ) -> Result<Option<OrderRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE platform = ?1 AND credential_id = ?2 AND exchange_order_id = ?3 ORDER BY id DESC LIMIT 1",
        )
        .bind(platform.name())
        .bind(credential_id)
        .bind(exchange_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to look up order {}: {}", exchange_order_id, e);
            DatabaseError::QueryError(format!("Failed to look up order: {}", e))
        })
    }

    /// Close an OPEN row, attaching only fields that are still missing.
    ///
    /// Realized profit is written only when the stored value is below
    /// [`PNL_EPSILON`]; the resulting change is added to the robot's total.
    /// Returns the profit delta, or `None` when the row was not OPEN.
    pub async fn close_row(&self, id: i64, update: &CloseUpdate) -> Result<Option<f64>, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin close transaction for order {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to begin transaction: {}", e))
        })?;

        let current: Option<(i64, Option<f64>, Option<DateTime<Utc>>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT robot_id, realized_profit, open_time, created_at FROM orders WHERE id = ?1 AND status = 'OPEN'",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| write_error("Failed to read order for close", e))?;

        let Some((robot_id, stored_profit, open_time, created_at)) = current else {
            return Ok(None);
        };

        let stored = stored_profit.unwrap_or(0.0);
        let realized = if stored.abs() < PNL_EPSILON {
            update.realized_profit
        } else {
            stored
        };
        let delta = realized - stored;
        let hold_secs = (update.close_time - open_time.unwrap_or(created_at))
            .num_seconds()
            .max(0);

        let rows = sqlx::query(
            r#"
            UPDATE orders SET
                status = 'CLOSED',
                is_open = 0,
                close_price = COALESCE(close_price, ?1),
                close_time = COALESCE(close_time, ?2),
                realized_profit = ?3,
                hold_duration_secs = COALESCE(hold_duration_secs, ?4),
                close_reason = COALESCE(close_reason, ?5),
                close_order_id = COALESCE(close_order_id, ?6),
                close_fee = COALESCE(close_fee, ?7),
                close_fee_currency = COALESCE(close_fee_currency, ?8),
                close_mark_price = COALESCE(close_mark_price, ?9),
                highest_profit = MAX(highest_profit, COALESCE(?10, highest_profit)),
                updated_at = ?11
            WHERE id = ?12 AND status = 'OPEN'
            "#,
        )
        .bind(update.close_price)
        .bind(update.close_time)
        .bind(realized)
        .bind(hold_secs)
        .bind(&update.close_reason)
        .bind(&update.close_order_id)
        .bind(update.close_fee)
        .bind(&update.close_fee_currency)
        .bind(update.close_mark_price)
        .bind(update.highest_profit)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("Failed to close order", e))?
        .rows_affected();

        if rows == 0 {
            return Ok(None);
        }

        if delta.abs() > f64::EPSILON {
            sqlx::query(
                "UPDATE robots SET total_profit = total_profit + ?1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(delta)
            .bind(Utc::now())
            .bind(robot_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error("Failed to add robot profit", e))?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit close of order {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to commit close: {}", e))
        })?;

        debug!("Closed ledger row {} (realized {:.4})", id, realized);
        Ok(Some(delta))
    }

    /// Refresh mark price and PnL on an OPEN row when they moved beyond the epsilon.
    ///
    /// `highest_profit` only ever increases. Returns whether anything was written.
    pub async fn update_live_metrics(
        &self,
        id: i64,
        mark_price: f64,
        unrealized_profit: f64,
        highest_profit: f64,
    ) -> Result<bool, DatabaseError> {
        let rows = sqlx::query(
            r#"
            UPDATE orders SET
                mark_price = ?1,
                unrealized_profit = ?2,
                highest_profit = MAX(highest_profit, ?3),
                updated_at = ?4
            WHERE id = ?5 AND status = 'OPEN' AND (
                mark_price IS NULL
                OR unrealized_profit IS NULL
                OR ABS(unrealized_profit - ?2) > ?6
                OR highest_profit < ?3
            )
            "#,
        )
        .bind(mark_price)
        .bind(unrealized_profit)
        .bind(highest_profit)
        .bind(Utc::now())
        .bind(id)
        .bind(LIVE_METRICS_EPSILON)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to update live metrics", e))?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Fill in average price / filled quantity from order history
    pub async fn backfill_fill_fields(
        &self,
        id: i64,
        avg_price: f64,
        filled_quantity: f64,
    ) -> Result<bool, DatabaseError> {
        if !(avg_price > 0.0) && !(filled_quantity > 0.0) {
            return Ok(false);
        }
        let rows = sqlx::query(
            r#"
            UPDATE orders SET
                avg_price = CASE WHEN ?1 > 0 AND ABS(avg_price - ?1) > ?3 THEN ?1 ELSE avg_price END,
                filled_quantity = CASE WHEN ?2 > 0 AND ABS(filled_quantity - ?2) > ?4 THEN ?2 ELSE filled_quantity END,
                updated_at = ?5
            WHERE id = ?6 AND (
                (?1 > 0 AND ABS(avg_price - ?1) > ?3)
                OR (?2 > 0 AND ABS(filled_quantity - ?2) > ?4)
            )
            "#,
        )
        .bind(avg_price)
        .bind(filled_quantity)
        .bind(AVG_PRICE_EPSILON)
        .bind(FILLED_QTY_EPSILON)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to backfill order", e))?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Record the close order and reason on an OPEN row, keeping earlier values
    pub async fn mark_close_requested(
        &self,
        id: i64,
        close_order_id: Option<&str>,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            r#"
            UPDATE orders SET
                close_order_id = COALESCE(close_order_id, ?1),
                close_reason = COALESCE(close_reason, ?2),
                updated_at = ?3
            WHERE id = ?4 AND status = 'OPEN'
            "#,
        )
        .bind(close_order_id)
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to record close request", e))?
        .rows_affected();

        if rows == 0 {
            warn!("Close request for order {} found no OPEN row", id);
        }
        Ok(())
    }
}

type IdQuery<'q> = sqlx::query::QueryAs<'q, sqlx::Sqlite, (i64,), sqlx::sqlite::SqliteArguments<'q>>;

// Binds ?1..?10 of EXCHANGE_UPDATE_SET
fn bind_exchange_update<'q>(
    query: IdQuery<'q>,
    order: &'q ExchangeOrder,
    status: LedgerStatus,
) -> IdQuery<'q> {
    let open_time = DateTime::from_timestamp_millis(order.update_time_ms.max(order.create_time_ms))
        .unwrap_or_else(Utc::now);
    query
        .bind(status.as_str())
        .bind(&order.raw_status)
        .bind(order.is_open)
        .bind(order.filled_quantity)
        .bind(order.avg_price)
        .bind(order.price)
        .bind(order.quantity)
        .bind(open_time)
        .bind(Utc::now())
        .bind(order.update_time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::persistence::init_database;

    fn order(id: &str, status: &str, filled: f64) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id.to_string(),
            client_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            position_side: Some(PositionSide::Long),
            order_type: "MARKET".to_string(),
            reduce_only: false,
            price: 0.0,
            quantity: 0.01,
            filled_quantity: filled,
            avg_price: if filled > 0.0 { 50000.0 } else { 0.0 },
            raw_status: status.to_lowercase(),
            status: status.to_string(),
            is_open: status == "NEW",
            create_time_ms: 1_700_000_000_000,
            update_time_ms: 1_700_000_001_000,
        }
    }

    async fn setup() -> (DbPool, OrderRepository, i64) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let (robot_id,): (i64,) = sqlx::query_as(
            "INSERT INTO robots (name, credential_id, platform, symbol, status) VALUES ('r1', 1, 'okx', 'BTCUSDT', 2) RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        (pool.clone(), OrderRepository::new(pool), robot_id)
    }

    #[test]
    fn test_ledger_status_mapping() {
        assert_eq!(ledger_status_for(&order("1", "NEW", 0.0)), Some(LedgerStatus::Pending));
        assert_eq!(ledger_status_for(&order("1", "FILLED", 0.01)), Some(LedgerStatus::Open));
        assert_eq!(ledger_status_for(&order("1", "CANCELED", 0.0)), Some(LedgerStatus::Canceled));
        assert_eq!(ledger_status_for(&order("1", "REJECTED", 0.0)), Some(LedgerStatus::Failed));

        let mut closing = order("1", "FILLED", 0.01);
        closing.side = OrderSide::Sell;
        assert_eq!(ledger_status_for(&closing), None);
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let (_pool, repo, robot_id) = setup().await;

        let pending = order("A1", "NEW", 0.0);
        let first = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &pending, LedgerSource::Stream, None)
            .await
            .unwrap();
        let UpsertOutcome::Inserted(id) = first else {
            panic!("expected insert, got {:?}", first);
        };

        let filled = order("A1", "FILLED", 0.01);
        let second = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &filled, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Updated(id));

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, "OPEN");
        assert!((row.filled_quantity - 0.01).abs() < 1e-12);
        assert!(row.open_time.is_some());

        // Replaying the same event changes nothing
        let again = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &filled, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome::Updated(id));
        assert_eq!(repo.list_by_robot(robot_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_on_same_side_is_skipped() {
        let (_pool, repo, robot_id) = setup().await;

        let first = order("A1", "FILLED", 0.01);
        repo.upsert_from_exchange(robot_id, 1, Platform::Okx, &first, LedgerSource::Stream, None)
            .await
            .unwrap();

        let second = order("A2", "FILLED", 0.02);
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &second, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
        assert_eq!(repo.open_rows(robot_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_row_not_promoted_while_side_held() {
        let (_pool, repo, robot_id) = setup().await;

        let pending = order("P1", "NEW", 0.0);
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &pending, LedgerSource::Stream, None)
            .await
            .unwrap();
        let UpsertOutcome::Inserted(pending_id) = outcome else {
            panic!("expected insert");
        };

        repo.upsert_from_exchange(
            robot_id,
            1,
            Platform::Okx,
            &order("A1", "FILLED", 0.01),
            LedgerSource::Stream,
            None,
        )
        .await
        .unwrap();

        repo.upsert_from_exchange(
            robot_id,
            1,
            Platform::Okx,
            &order("P1", "FILLED", 0.01),
            LedgerSource::Stream,
            None,
        )
        .await
        .unwrap();

        let row = repo.get(pending_id).await.unwrap().unwrap();
        assert_eq!(row.status, "PENDING");
        assert_eq!(repo.open_rows(robot_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_missing_cancel_is_promoted_when_fill_surfaces() {
        let (_pool, repo, robot_id) = setup().await;

        let outcome = repo
            .upsert_from_exchange(
                robot_id,
                1,
                Platform::Okx,
                &order("M1", "NEW", 0.0),
                LedgerSource::Stream,
                None,
            )
            .await
            .unwrap();
        let UpsertOutcome::Inserted(id) = outcome else {
            panic!("expected insert");
        };
        assert!(repo.cancel_pending_missing(Platform::Okx, 1, "M1").await.unwrap());
        let canceled = repo.get(id).await.unwrap().unwrap();
        assert!(canceled.awaits_fill());

        let mut filled = order("M1", "FILLED", 0.01);
        filled.update_time_ms += 5_000;
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &filled, LedgerSource::OrderHistory, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated(id));

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, "OPEN");
        assert_eq!(row.raw_status.as_deref(), Some("filled"));
        assert!(!row.awaits_fill());

        // A plain exchange cancel stays terminal
        let outcome = repo
            .upsert_from_exchange(
                robot_id,
                1,
                Platform::Okx,
                &order("M2", "NEW", 0.0),
                LedgerSource::Stream,
                None,
            )
            .await
            .unwrap();
        let UpsertOutcome::Inserted(other) = outcome else {
            panic!("expected insert");
        };
        let mut canceled = order("M2", "CANCELED", 0.0);
        canceled.update_time_ms += 1_000;
        repo.upsert_from_exchange(robot_id, 1, Platform::Okx, &canceled, LedgerSource::Stream, None)
            .await
            .unwrap();
        let mut late_fill = order("M2", "FILLED", 0.01);
        late_fill.update_time_ms += 2_000;
        repo.upsert_from_exchange(robot_id, 1, Platform::Okx, &late_fill, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(repo.get(other).await.unwrap().unwrap().status, "CANCELED");
    }

    #[tokio::test]
    async fn test_out_of_order_event_does_not_regress_row() {
        let (_pool, repo, robot_id) = setup().await;

        let filled = order("A1", "FILLED", 0.01);
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &filled, LedgerSource::Stream, None)
            .await
            .unwrap();
        let UpsertOutcome::Inserted(id) = outcome else {
            panic!("expected insert");
        };

        let mut stale = order("A1", "NEW", 0.0);
        stale.update_time_ms = filled.update_time_ms - 500;
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &stale, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated(id));

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, "OPEN");
        assert_eq!(row.raw_status.as_deref(), Some("filled"));
        assert!(!row.is_open);
        assert_eq!(row.exchange_update_time_ms, Some(filled.update_time_ms));
        assert!((row.filled_quantity - 0.01).abs() < 1e-12);

        // A newer fact still lands
        let mut newer = order("A1", "FILLED", 0.01);
        newer.raw_status = "filled_confirmed".to_string();
        newer.update_time_ms = filled.update_time_ms + 500;
        repo.upsert_from_exchange(robot_id, 1, Platform::Okx, &newer, LedgerSource::Stream, None)
            .await
            .unwrap();
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.raw_status.as_deref(), Some("filled_confirmed"));
        assert_eq!(row.exchange_update_time_ms, Some(newer.update_time_ms));
    }

    #[tokio::test]
    async fn test_client_id_links_engine_row() {
        let (_pool, repo, robot_id) = setup().await;

        let mut engine_row = NewOrder::from_exchange(
            robot_id,
            1,
            Platform::Okx,
            &order("unused", "NEW", 0.0),
            LedgerStatus::Pending,
            LedgerSource::Engine,
        );
        engine_row.exchange_order_id = None;
        engine_row.client_order_id = Some("rb1-abc".to_string());
        let id = repo.insert(&engine_row).await.unwrap();

        let mut reported = order("X9", "FILLED", 0.01);
        reported.client_order_id = Some("rb1-abc".to_string());
        let outcome = repo
            .upsert_from_exchange(robot_id, 1, Platform::Okx, &reported, LedgerSource::Stream, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated(id));

        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.exchange_order_id.as_deref(), Some("X9"));
        assert_eq!(row.status, "OPEN");
        assert_eq!(row.source, "engine");
    }

    #[tokio::test]
    async fn test_close_row_adds_profit_once() {
        let (pool, repo, robot_id) = setup().await;
        repo.upsert_from_exchange(
            robot_id,
            1,
            Platform::Okx,
            &order("A1", "FILLED", 0.01),
            LedgerSource::Stream,
            None,
        )
        .await
        .unwrap();
        let open = repo.find_open(robot_id, PositionSide::Long).await.unwrap().unwrap();
        repo.mark_close_requested(open.id, Some("C1"), "stop_loss").await.unwrap();

        let update = CloseUpdate {
            close_price: 50500.0,
            close_time: Utc::now(),
            realized_profit: 5.0,
            close_reason: "manual close (sync detected)".to_string(),
            ..Default::default()
        };
        assert_eq!(repo.close_row(open.id, &update).await.unwrap(), Some(5.0));
        assert_eq!(repo.close_row(open.id, &update).await.unwrap(), None);

        let row = repo.get(open.id).await.unwrap().unwrap();
        assert_eq!(row.status, "CLOSED");
        assert!(!row.is_open);
        assert_eq!(row.close_reason.as_deref(), Some("stop_loss"));
        assert_eq!(row.close_order_id.as_deref(), Some("C1"));
        assert_eq!(row.realized_profit, Some(5.0));
        assert!(row.hold_duration_secs.is_some());

        let (total,): (f64,) = sqlx::query_as("SELECT total_profit FROM robots WHERE id = ?1")
            .bind(robot_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!((total - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_live_metrics_epsilon() {
        let (_pool, repo, robot_id) = setup().await;
        repo.upsert_from_exchange(
            robot_id,
            1,
            Platform::Okx,
            &order("A1", "FILLED", 0.01),
            LedgerSource::Stream,
            None,
        )
        .await
        .unwrap();
        let open = repo.find_open(robot_id, PositionSide::Long).await.unwrap().unwrap();

        assert!(repo.update_live_metrics(open.id, 50100.0, 1.0, 1.0).await.unwrap());
        assert!(!repo.update_live_metrics(open.id, 50100.5, 1.005, 1.0).await.unwrap());
        assert!(repo.update_live_metrics(open.id, 50050.0, 0.5, 1.0).await.unwrap());

        let row = repo.get(open.id).await.unwrap().unwrap();
        assert!((row.highest_profit - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mark_failed_only_from_pending() {
        let (_pool, repo, robot_id) = setup().await;
        let outcome = repo
            .upsert_from_exchange(
                robot_id,
                1,
                Platform::Okx,
                &order("A1", "FILLED", 0.01),
                LedgerSource::Stream,
                None,
            )
            .await
            .unwrap();
        let UpsertOutcome::Inserted(id) = outcome else {
            panic!("expected insert");
        };
        repo.mark_failed(id, "timeout").await.unwrap();
        assert_eq!(repo.get(id).await.unwrap().unwrap().status, "OPEN");
    }
}

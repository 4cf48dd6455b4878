//! Raw exchange order snapshots.
//!
//! Mirrors what each venue reports, independent of the ledger. Used by the
//! open-orders fallback sync to detect orders the exchange no longer lists.

use super::models::ExchangeOrderRecord;
use super::{write_error, DatabaseError, DbPool};
use crate::domain::entities::market::ExchangeOrder;
use crate::domain::entities::platform::Platform;
use chrono::Utc;
use tracing::{debug, error};

/// Raw status written on rows that vanished from the exchange's open list
pub const SYNC_MISSING_STATUS: &str = "sync_missing";

pub struct ExchangeOrderRepository {
    pool: DbPool,
}

impl ExchangeOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert a snapshot; an older update never overwrites a newer one
    pub async fn upsert(
        &self,
        platform: Platform,
        credential_id: i64,
        robot_id: Option<i64>,
        order: &ExchangeOrder,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO exchange_orders (
                platform, credential_id, robot_id, symbol, exchange_order_id, client_order_id,
                side, position_side, order_type, reduce_only, price, quantity, filled_quantity,
                avg_price, raw_status, status, is_open, create_time_ms, update_time_ms, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT (platform, credential_id, exchange_order_id) DO UPDATE SET
                robot_id = COALESCE(excluded.robot_id, exchange_orders.robot_id),
                client_order_id = COALESCE(excluded.client_order_id, exchange_orders.client_order_id),
                filled_quantity = excluded.filled_quantity,
                avg_price = CASE WHEN excluded.avg_price > 0 THEN excluded.avg_price ELSE exchange_orders.avg_price END,
                raw_status = excluded.raw_status,
                status = excluded.status,
                is_open = excluded.is_open,
                update_time_ms = excluded.update_time_ms,
                updated_at = excluded.updated_at
            WHERE excluded.update_time_ms >= exchange_orders.update_time_ms
            "#,
        )
        .bind(platform.name())
        .bind(credential_id)
        .bind(robot_id)
        .bind(&order.symbol)
        .bind(&order.order_id)
        .bind(&order.client_order_id)
        .bind(order.side.as_str())
        .bind(order.position_side.map(|s| s.as_str()))
        .bind(&order.order_type)
        .bind(order.reduce_only)
        .bind(order.price)
        .bind(order.quantity)
        .bind(order.filled_quantity)
        .bind(order.avg_price)
        .bind(&order.raw_status)
        .bind(&order.status)
        .bind(order.is_open)
        .bind(order.create_time_ms)
        .bind(order.update_time_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to upsert exchange order", e))?;
        Ok(())
    }

    pub async fn list_open(
        &self,
        platform: Platform,
        credential_id: i64,
        symbol: &str,
    ) -> Result<Vec<ExchangeOrderRecord>, DatabaseError> {
        sqlx::query_as::<_, ExchangeOrderRecord>(
            "SELECT * FROM exchange_orders WHERE platform = ?1 AND credential_id = ?2 AND symbol = ?3 AND is_open = 1",
        )
        .bind(platform.name())
        .bind(credential_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list open exchange orders: {}", e);
            DatabaseError::QueryError(format!("Failed to list open exchange orders: {}", e))
        })
    }

    pub async fn get(
        &self,
        platform: Platform,
        credential_id: i64,
        exchange_order_id: &str,
    ) -> Result<Option<ExchangeOrderRecord>, DatabaseError> {
        sqlx::query_as::<_, ExchangeOrderRecord>(
            "SELECT * FROM exchange_orders WHERE platform = ?1 AND credential_id = ?2 AND exchange_order_id = ?3",
        )
        .bind(platform.name())
        .bind(credential_id)
        .bind(exchange_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get exchange order {}: {}", exchange_order_id, e);
            DatabaseError::QueryError(format!("Failed to get exchange order: {}", e))
        })
    }

    /// Flag rows the exchange stopped listing as canceled
    pub async fn mark_missing(&self, ids: &[i64]) -> Result<u64, DatabaseError> {
        let mut affected = 0;
        for id in ids {
            affected += sqlx::query(
                "UPDATE exchange_orders SET raw_status = ?1, status = 'CANCELED', is_open = 0, updated_at = ?2 WHERE id = ?3 AND is_open = 1",
            )
            .bind(SYNC_MISSING_STATUS)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("Failed to mark exchange order missing", e))?
            .rows_affected();
        }
        if affected > 0 {
            debug!("Marked {} exchange orders as {}", affected, SYNC_MISSING_STATUS);
        }
        Ok(affected)
    }
}

//! Per-fill records keyed by (credential, platform, trade id).

use super::models::{OrderLink, TradeFillRecord};
use super::{write_error, DatabaseError, DbPool};
use crate::domain::entities::market::Trade;
use crate::domain::entities::platform::Platform;
use chrono::Utc;
use std::collections::HashMap;
use tracing::error;

pub struct TradeFillRepository {
    pool: DbPool,
}

impl TradeFillRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Resolve ledger owners for exchange order ids, matching either the
    /// opening order or the recorded close order.
    pub async fn find_order_links(
        &self,
        credential_id: i64,
        platform: Platform,
        order_ids: &[String],
    ) -> Result<HashMap<String, OrderLink>, DatabaseError> {
        let mut links = HashMap::new();
        if order_ids.is_empty() {
            return Ok(links);
        }

        let placeholders = vec!["?"; order_ids.len()].join(", ");
        let sql = format!(
            "SELECT robot_id, id, exchange_order_id, close_order_id FROM orders \
             WHERE credential_id = ? AND platform = ? \
             AND (exchange_order_id IN ({0}) OR close_order_id IN ({0})) ORDER BY id",
            placeholders
        );

        let mut query = sqlx::query_as::<_, (i64, i64, Option<String>, Option<String>)>(&sql)
            .bind(credential_id)
            .bind(platform.name());
        for id in order_ids {
            query = query.bind(id);
        }
        for id in order_ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            error!("Failed to resolve fill owners: {}", e);
            DatabaseError::QueryError(format!("Failed to resolve fill owners: {}", e))
        })?;

        for (robot_id, ledger_id, exchange_order_id, close_order_id) in rows {
            let link = OrderLink {
                robot_id,
                ledger_id,
            };
            for key in [exchange_order_id, close_order_id].into_iter().flatten() {
                if order_ids.contains(&key) {
                    links.entry(key).or_insert(link);
                }
            }
        }
        Ok(links)
    }

    /// Append a fill. Facts of a stored fill never change; a later sighting
    /// may only attach ownership that was unknown before.
    pub async fn upsert(
        &self,
        credential_id: i64,
        platform: Platform,
        trade: &Trade,
        robot_id: Option<i64>,
        ledger_id: Option<i64>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO trade_fills (
                credential_id, platform, symbol, exchange_order_id, trade_id, side, position_side,
                price, quantity, realized_pnl, fee, fee_currency, trade_time_ms, robot_id,
                order_ledger_id, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)
            ON CONFLICT (credential_id, platform, trade_id) DO UPDATE SET
                robot_id = COALESCE(trade_fills.robot_id, excluded.robot_id),
                order_ledger_id = COALESCE(trade_fills.order_ledger_id, excluded.order_ledger_id),
                updated_at = excluded.updated_at
            WHERE trade_fills.robot_id IS NULL OR trade_fills.order_ledger_id IS NULL
            "#,
        )
        .bind(credential_id)
        .bind(platform.name())
        .bind(&trade.symbol)
        .bind(&trade.order_id)
        .bind(trade.resolved_trade_id())
        .bind(trade.side.as_str())
        .bind(trade.position_side.map(|s| s.as_str()))
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.realized_pnl)
        .bind(trade.fee.abs())
        .bind(&trade.fee_currency)
        .bind(trade.timestamp_ms)
        .bind(robot_id)
        .bind(ledger_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to upsert trade fill", e))?;
        Ok(())
    }

    pub async fn list_by_order(
        &self,
        credential_id: i64,
        platform: Platform,
        exchange_order_id: &str,
    ) -> Result<Vec<TradeFillRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeFillRecord>(
            "SELECT * FROM trade_fills WHERE credential_id = ?1 AND platform = ?2 AND exchange_order_id = ?3 ORDER BY trade_time_ms",
        )
        .bind(credential_id)
        .bind(platform.name())
        .bind(exchange_order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list fills for order {}: {}", exchange_order_id, e);
            DatabaseError::QueryError(format!("Failed to list fills: {}", e))
        })
    }

    pub async fn count(&self, credential_id: i64, platform: Platform) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trade_fills WHERE credential_id = ?1 AND platform = ?2",
        )
        .bind(credential_id)
        .bind(platform.name())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count fills: {}", e);
            DatabaseError::QueryError(format!("Failed to count fills: {}", e))
        })?;
        Ok(count)
    }
}

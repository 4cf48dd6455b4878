//! Robot desired state and risk profiles.

use super::models::{NewRobot, RiskParamsRecord, RobotRecord};
use super::{write_error, DatabaseError, DbPool};
use crate::domain::entities::platform::Platform;
use crate::domain::entities::robot::{RiskProfile, Robot, RobotStatus};
use chrono::{DateTime, Utc};
use tracing::{error, info};

const ROBOT_COLUMNS: &str = "id, name, credential_id, platform, symbol, status, leverage, \
    max_runtime_secs, schedule_start, schedule_stop, start_time, pause_time, \
    default_market_state, total_profit";

pub struct RobotRepository {
    pool: DbPool,
}

impl RobotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a robot together with its risk profile; the profile must cover every market state
    pub async fn insert(&self, robot: &NewRobot, profile: &RiskProfile) -> Result<i64, DatabaseError> {
        profile.validate()?;

        let mut tx = self.pool.begin().await?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO robots (
                name, credential_id, platform, symbol, status, leverage, max_runtime_secs,
                schedule_start, schedule_stop, start_time, default_market_state
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            RETURNING id
            "#,
        )
        .bind(&robot.name)
        .bind(robot.credential_id)
        .bind(robot.platform.name())
        .bind(&robot.symbol)
        .bind(robot.status.code())
        .bind(robot.leverage)
        .bind(robot.max_runtime_secs)
        .bind(robot.schedule_start)
        .bind(robot.schedule_stop)
        .bind(robot.start_time)
        .bind(robot.default_market_state.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_error("Failed to insert robot", e))?;

        write_risk_rows(&mut tx, id, profile).await?;
        tx.commit().await?;

        info!("Created robot {} ({} {})", id, robot.platform, robot.symbol);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Robot>, DatabaseError> {
        let sql = format!("SELECT {} FROM robots WHERE id = ?1", ROBOT_COLUMNS);
        let record = sqlx::query_as::<_, RobotRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get robot {}: {}", id, e);
                DatabaseError::QueryError(format!("Failed to get robot: {}", e))
            })?;

        match record {
            Some(record) => {
                let profile = self.load_risk_profile(id).await?;
                Ok(Some(record.into_robot(profile)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Robot>, DatabaseError> {
        let sql = format!("SELECT {} FROM robots ORDER BY id", ROBOT_COLUMNS);
        let records = sqlx::query_as::<_, RobotRecord>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list robots: {}", e);
                DatabaseError::QueryError(format!("Failed to list robots: {}", e))
            })?;
        self.hydrate(records).await
    }

    pub async fn list_by_status(&self, status: RobotStatus) -> Result<Vec<Robot>, DatabaseError> {
        let sql = format!("SELECT {} FROM robots WHERE status = ?1 ORDER BY id", ROBOT_COLUMNS);
        let records = sqlx::query_as::<_, RobotRecord>(&sql)
            .bind(status.code())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list robots by status: {}", e);
                DatabaseError::QueryError(format!("Failed to list robots: {}", e))
            })?;
        self.hydrate(records).await
    }

    async fn hydrate(&self, records: Vec<RobotRecord>) -> Result<Vec<Robot>, DatabaseError> {
        let mut robots = Vec::with_capacity(records.len());
        for record in records {
            let profile = self.load_risk_profile(record.id).await?;
            robots.push(record.into_robot(profile)?);
        }
        Ok(robots)
    }

    /// Robots that may own orders on this credential: running or paused
    pub async fn robot_ids_for_credential(
        &self,
        credential_id: i64,
        platform: Platform,
    ) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM robots WHERE credential_id = ?1 AND platform = ?2 AND status IN (?3, ?4) ORDER BY id",
        )
        .bind(credential_id)
        .bind(platform.name())
        .bind(RobotStatus::Running.code())
        .bind(RobotStatus::Paused.code())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list robots for credential {}: {}", credential_id, e);
            DatabaseError::QueryError(format!("Failed to list robots: {}", e))
        })?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn load_risk_profile(&self, robot_id: i64) -> Result<RiskProfile, DatabaseError> {
        let rows = sqlx::query_as::<_, RiskParamsRecord>(
            "SELECT * FROM robot_risk_params WHERE robot_id = ?1",
        )
        .bind(robot_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load risk profile for robot {}: {}", robot_id, e);
            DatabaseError::QueryError(format!("Failed to load risk profile: {}", e))
        })?;

        let mut profile = RiskProfile::new();
        for row in rows {
            let (state, params) = row.into_params()?;
            profile.set(state, params);
        }
        Ok(profile)
    }

    /// Replace a robot's risk profile atomically
    pub async fn save_risk_profile(
        &self,
        robot_id: i64,
        profile: &RiskProfile,
    ) -> Result<(), DatabaseError> {
        profile.validate()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM robot_risk_params WHERE robot_id = ?1")
            .bind(robot_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error("Failed to clear risk profile", e))?;
        write_risk_rows(&mut tx, robot_id, profile).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: RobotStatus) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE robots SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.code())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error("Failed to set robot status", e))?;
        Ok(())
    }

    /// Running from `now`: consumes the scheduled start and clears any pause
    pub async fn mark_started(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE robots SET status = ?1, start_time = ?2, schedule_start = NULL, pause_time = NULL, updated_at = ?2 WHERE id = ?3",
        )
        .bind(RobotStatus::Running.code())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to mark robot started", e))?;
        Ok(())
    }

    /// Paused from `now`: consumes the scheduled stop
    pub async fn mark_paused(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE robots SET status = ?1, pause_time = ?2, schedule_stop = NULL, updated_at = ?2 WHERE id = ?3",
        )
        .bind(RobotStatus::Paused.code())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to mark robot paused", e))?;
        Ok(())
    }

    pub async fn set_schedule(
        &self,
        id: i64,
        schedule_start: Option<DateTime<Utc>>,
        schedule_stop: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE robots SET schedule_start = ?1, schedule_stop = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(schedule_start)
        .bind(schedule_stop)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to set robot schedule", e))?;
        Ok(())
    }
}

async fn write_risk_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    robot_id: i64,
    profile: &RiskProfile,
) -> Result<(), DatabaseError> {
    for (state, params) in profile.iter() {
        sqlx::query(
            r#"
            INSERT INTO robot_risk_params (
                robot_id, market_state, window_secs, threshold, stop_loss_percent,
                auto_start_retreat_percent, profit_retreat_percent, margin_percent
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(robot_id)
        .bind(state.as_str())
        .bind(params.window_secs as i64)
        .bind(params.threshold)
        .bind(params.stop_loss_percent)
        .bind(params.auto_start_retreat_percent)
        .bind(params.profit_retreat_percent)
        .bind(params.margin_percent)
        .execute(&mut **tx)
        .await
        .map_err(|e| write_error("Failed to write risk parameters", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::robot::{MarketState, RiskParams};
    use crate::persistence::init_database;

    fn params(window_secs: u64) -> RiskParams {
        RiskParams {
            window_secs,
            threshold: 50.0,
            stop_loss_percent: 20.0,
            auto_start_retreat_percent: 10.0,
            profit_retreat_percent: 30.0,
            margin_percent: 10.0,
        }
    }

    fn new_robot(status: RobotStatus) -> NewRobot {
        NewRobot {
            name: "btc-trend".to_string(),
            credential_id: 1,
            platform: Platform::Okx,
            symbol: "BTCUSDT".to_string(),
            status,
            leverage: 10.0,
            max_runtime_secs: None,
            schedule_start: None,
            schedule_stop: None,
            start_time: None,
            default_market_state: MarketState::Trend,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_with_profile() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = RobotRepository::new(pool);
        let profile = RiskProfile::uniform(params(60)).with(MarketState::Volatile, params(30));

        let id = repo.insert(&new_robot(RobotStatus::Running), &profile).await.unwrap();
        let robot = repo.get(id).await.unwrap().unwrap();

        assert_eq!(robot.platform, Platform::Okx);
        assert_eq!(robot.status, RobotStatus::Running);
        assert_eq!(robot.risk_profile, profile);
        assert_eq!(
            robot.risk_profile.params_for(MarketState::Volatile).unwrap().window_secs,
            30
        );
    }

    #[tokio::test]
    async fn test_incomplete_profile_rejected() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = RobotRepository::new(pool);
        let partial = RiskProfile::new().with(MarketState::Trend, params(60));

        let result = repo.insert(&new_robot(RobotStatus::Running), &partial).await;
        assert!(matches!(result, Err(DatabaseError::InvalidData(_))));
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = RobotRepository::new(pool);
        let profile = RiskProfile::uniform(params(60));
        let id = repo.insert(&new_robot(RobotStatus::NotStarted), &profile).await.unwrap();
        let now = Utc::now();

        repo.set_schedule(id, Some(now), Some(now)).await.unwrap();
        repo.mark_started(id, now).await.unwrap();
        let robot = repo.get(id).await.unwrap().unwrap();
        assert_eq!(robot.status, RobotStatus::Running);
        assert!(robot.schedule_start.is_none());
        assert!(robot.schedule_stop.is_some());
        assert_eq!(repo.robot_ids_for_credential(1, Platform::Okx).await.unwrap(), vec![id]);

        repo.mark_paused(id, now).await.unwrap();
        let robot = repo.get(id).await.unwrap().unwrap();
        assert_eq!(robot.status, RobotStatus::Paused);
        assert!(robot.schedule_stop.is_none());
        assert!(robot.pause_time.is_some());

        repo.set_status(id, RobotStatus::Stopped).await.unwrap();
        assert!(repo.robot_ids_for_credential(1, Platform::Okx).await.unwrap().is_empty());
        assert_eq!(repo.list_by_status(RobotStatus::Stopped).await.unwrap().len(), 1);
    }
}

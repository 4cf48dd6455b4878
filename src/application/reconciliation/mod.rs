//! Reconciliation Service
//!
//! Keeps the local ledger equal to exchange truth. Two paths write it:
//!
//! - the incremental path applies streamed order events as they arrive
//!   (`incremental`), and
//! - the reconciliation pass compares exchange positions with OPEN rows and
//!   resolves every discrepancy (`positions`), with a throttled open-orders
//!   safety net (`open_orders`).
//!
//! A slower loop keeps the fill ledger current from trade history
//! (`fill_sync`).
//!
//! Passes are serialized per robot by an in-progress flag: a pass that finds
//! one already running returns immediately. Across robots, passes run in
//! parallel under a concurrency cap.

mod fill_sync;
mod incremental;
mod open_orders;
mod positions;

use crate::application::debounce::Debouncer;
use crate::application::robot_engine::EngineRegistry;
use crate::application::trade_fill_ledger::TradeFillLedger;
use crate::cache::TtlCache;
use crate::config::SyncConfig;
use crate::domain::entities::platform::Platform;
use crate::domain::entities::robot::{Robot, RobotStatus};
use crate::domain::errors::ValidationError;
use crate::domain::repositories::exchange_client::ExchangeError;
use crate::infrastructure::exchange_session_manager::{ExchangeSessionManager, SessionError};
use crate::persistence::exchange_order_repository::ExchangeOrderRepository;
use crate::persistence::order_repository::OrderRepository;
use crate::persistence::robot_repository::RobotRepository;
use crate::persistence::DatabaseError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use fill_sync::FillSyncReport;
pub use incremental::IncrementalOutcome;

/// Close reason written when a pass finds a leg flattened outside the engine
pub const SYNC_CLOSE_REASON: &str = "manual close (sync detected)";

const TRIGGER_THROTTLE: Duration = Duration::from_secs(1);
const TICKER_FALLBACK_TTL: Duration = Duration::from_secs(2);
const ORDER_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Robot {0} not found")]
    MissingRobot(i64),

    #[error("Invalid data: {0}")]
    InvalidData(#[from] ValidationError),
}

impl ReconciliationError {
    /// Network faults and rate limits, retried on the next cycle
    pub fn is_transient(&self) -> bool {
        match self {
            ReconciliationError::Exchange(e) => e.is_transient(),
            ReconciliationError::Session(SessionError::Construction(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// Missing or malformed data that skips one unit of work, not the batch
    pub fn is_data_inconsistency(&self) -> bool {
        matches!(
            self,
            ReconciliationError::InvalidData(_)
                | ReconciliationError::MissingRobot(_)
                | ReconciliationError::Database(DatabaseError::InvalidData(_))
        )
    }
}

/// Cloneable handle for requesting a pass. Never blocks; a full queue drops
/// the request since the periodic tick catches up anyway.
#[derive(Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<i64>,
    dropped: Arc<AtomicU64>,
}

impl ReconcileTrigger {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let trigger = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (trigger, rx)
    }

    pub fn request(&self, robot_id: i64) -> bool {
        match self.tx.try_send(robot_id) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Reconcile trigger for robot {} dropped", robot_id);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// What one pass changed
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub robot_id: i64,
    /// Another pass for the robot was already running
    pub skipped: bool,
    pub closed: usize,
    pub adopted: usize,
    pub synthesized: usize,
    pub refreshed: usize,
    pub backfilled: usize,
    pub realized_delta: f64,
    pub open_orders_synced: bool,
    pub orders_marked_missing: u64,
    /// Missing orders found filled in order history
    pub orders_promoted: u64,
}

impl PassReport {
    fn new(robot_id: i64) -> Self {
        Self {
            robot_id,
            ..Default::default()
        }
    }

    pub fn changed_ledger(&self) -> bool {
        self.closed + self.adopted + self.synthesized + self.backfilled > 0
            || self.orders_marked_missing + self.orders_promoted > 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationStats {
    pub total_passes: u64,
    pub failed_passes: u64,
    pub skipped_passes: u64,
    pub triggers_received: u64,
    pub last_pass: Option<DateTime<Utc>>,
}

/// Per-robot in-progress flag, cleared on drop
struct InProgressGuard {
    robots: Arc<std::sync::Mutex<HashSet<i64>>>,
    robot_id: i64,
}

impl InProgressGuard {
    fn try_acquire(robots: &Arc<std::sync::Mutex<HashSet<i64>>>, robot_id: i64) -> Option<Self> {
        let mut running = robots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(robot_id) {
            return None;
        }
        Some(Self {
            robots: robots.clone(),
            robot_id,
        })
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        let mut running = self.robots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        running.remove(&self.robot_id);
    }
}

pub struct ReconciliationService {
    orders: Arc<OrderRepository>,
    exchange_orders: ExchangeOrderRepository,
    robots: Arc<RobotRepository>,
    fills: Arc<TradeFillLedger>,
    sessions: Arc<ExchangeSessionManager>,
    engines: Arc<EngineRegistry>,
    config: SyncConfig,

    in_progress: Arc<std::sync::Mutex<HashSet<i64>>>,
    last_pass: Mutex<HashMap<i64, Instant>>,
    trigger_throttle: TtlCache<i64, ()>,
    ticker_cache: TtlCache<(Platform, String), f64>,
    robot_meta: TtlCache<(Platform, i64), Vec<Robot>>,
    open_orders_throttle: TtlCache<i64, ()>,
    empty_open_orders_since: Mutex<HashMap<i64, Instant>>,
    backfill: Debouncer<(Platform, i64, String)>,

    trigger: ReconcileTrigger,
    trigger_rx: Mutex<Option<mpsc::Receiver<i64>>>,
    stats: Mutex<ReconciliationStats>,
}

impl ReconciliationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: Arc<OrderRepository>,
        exchange_orders: ExchangeOrderRepository,
        robots: Arc<RobotRepository>,
        fills: Arc<TradeFillLedger>,
        sessions: Arc<ExchangeSessionManager>,
        engines: Arc<EngineRegistry>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (trigger, rx) = ReconcileTrigger::channel(config.reconcile_trigger_queue_capacity);
        Arc::new(Self {
            orders,
            exchange_orders,
            robots,
            fills,
            sessions,
            engines,
            in_progress: Arc::new(std::sync::Mutex::new(HashSet::new())),
            last_pass: Mutex::new(HashMap::new()),
            trigger_throttle: TtlCache::new(4096, TRIGGER_THROTTLE),
            ticker_cache: TtlCache::new(1024, TICKER_FALLBACK_TTL),
            robot_meta: TtlCache::new(1024, config.robot_meta_ttl),
            open_orders_throttle: TtlCache::new(4096, config.open_orders_sync_throttle),
            empty_open_orders_since: Mutex::new(HashMap::new()),
            backfill: Debouncer::new(config.trade_backfill_debounce),
            trigger,
            trigger_rx: Mutex::new(Some(rx)),
            stats: Mutex::new(ReconciliationStats::default()),
            config,
        })
    }

    pub fn trigger(&self) -> ReconcileTrigger {
        self.trigger.clone()
    }

    pub fn orders(&self) -> &Arc<OrderRepository> {
        &self.orders
    }

    pub async fn stats(&self) -> ReconciliationStats {
        self.stats.lock().await.clone()
    }

    /// Main loop: periodic ticks at the smallest poll interval plus triggers.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut triggers) = self.trigger_rx.lock().await.take() else {
            warn!("Reconciliation loop already running");
            return;
        };

        let semaphore = Arc::new(Semaphore::new(self.config.reconcile_concurrency));
        let mut ticker = tokio::time::interval(self.config.min_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Reconciliation loop started (tick {:?}, concurrency {})",
            self.config.min_poll_interval(),
            self.config.reconcile_concurrency
        );

        loop {
            tokio::select! {
                tick_at = ticker.tick() => {
                    self.clone().run_due(tick_at, &semaphore).await;
                }
                Some(robot_id) = triggers.recv() => {
                    self.stats.lock().await.triggers_received += 1;
                    if self.trigger_throttle.check_and_mark(robot_id).await {
                        let service = self.clone();
                        let permits = semaphore.clone();
                        tokio::spawn(async move {
                            let _permit = permits.acquire_owned().await.ok();
                            service.reconcile_logged(robot_id).await;
                        });
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Reconciliation loop stopped");
    }

    /// Reconcile every active robot whose platform interval has elapsed
    async fn run_due(self: Arc<Self>, tick_at: Instant, semaphore: &Arc<Semaphore>) -> usize {
        let robots = match self.active_robots().await {
            Ok(robots) => robots,
            Err(e) => {
                warn!("Failed to load robots for reconciliation: {}", e);
                return 0;
            }
        };

        let mut due = Vec::new();
        {
            let mut last_pass = self.last_pass.lock().await;
            for robot in &robots {
                let elapsed = last_pass
                    .get(&robot.id)
                    .map(|at| tick_at.saturating_duration_since(*at));
                if elapsed.map_or(true, |e| e >= self.config.poll_interval_for(robot.platform)) {
                    last_pass.insert(robot.id, tick_at);
                    due.push(robot.id);
                }
            }
        }

        let count = due.len();
        let mut tasks = JoinSet::new();
        for robot_id in due {
            let service = self.clone();
            let permits = semaphore.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                service.reconcile_logged(robot_id).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Reconciliation task ended abnormally: {}", e);
            }
        }
        if count > 0 {
            debug!("Reconciliation tick covered {} robots", count);
        }
        count
    }

    /// Reconcile all active robots now, ignoring intervals
    pub async fn reconcile_all(&self) -> Result<Vec<PassReport>, ReconciliationError> {
        let robots = self.active_robots().await?;
        let mut reports = Vec::with_capacity(robots.len());
        for robot in robots {
            if let Some(report) = self.reconcile_logged(robot.id).await {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    async fn active_robots(&self) -> Result<Vec<Robot>, DatabaseError> {
        let mut robots = self.robots.list_by_status(RobotStatus::Running).await?;
        robots.extend(self.robots.list_by_status(RobotStatus::Paused).await?);
        Ok(robots)
    }

    /// Run one pass and absorb its failure into a log line
    async fn reconcile_logged(&self, robot_id: i64) -> Option<PassReport> {
        let result = self.reconcile_robot(robot_id).await;

        let mut stats = self.stats.lock().await;
        stats.total_passes += 1;
        stats.last_pass = Some(Utc::now());
        match result {
            Ok(report) => {
                if report.skipped {
                    stats.skipped_passes += 1;
                } else if report.changed_ledger() {
                    info!(
                        robot_id,
                        "Reconciled: closed {}, adopted {}, synthesized {}, backfilled {}, missing orders {}, promoted {}",
                        report.closed,
                        report.adopted,
                        report.synthesized,
                        report.backfilled,
                        report.orders_marked_missing,
                        report.orders_promoted
                    );
                }
                Some(report)
            }
            Err(e) => {
                stats.failed_passes += 1;
                if e.is_transient() {
                    warn!(robot_id, "Reconciliation pass failed, retrying next cycle: {}", e);
                } else {
                    error!(robot_id, "Reconciliation pass failed: {}", e);
                }
                None
            }
        }
    }

    /// One full pass for `robot_id`: positions, then the open-orders fallback.
    pub async fn reconcile_robot(&self, robot_id: i64) -> Result<PassReport, ReconciliationError> {
        let Some(_guard) = InProgressGuard::try_acquire(&self.in_progress, robot_id) else {
            debug!("Reconciliation for robot {} already in progress", robot_id);
            return Ok(PassReport {
                skipped: true,
                ..PassReport::new(robot_id)
            });
        };

        let robot = self
            .robots
            .get(robot_id)
            .await?
            .ok_or(ReconciliationError::MissingRobot(robot_id))?;
        let client = self.sessions.get(robot.credential_id).await?;

        let mut report = PassReport::new(robot_id);
        let mut history = positions::OrderHistory::default();
        self.reconcile_positions(&robot, client.as_ref(), &mut history, &mut report)
            .await?;

        match self
            .sync_open_orders(&robot, client.as_ref(), &mut history)
            .await
        {
            Ok(Some(missing)) => {
                report.open_orders_synced = true;
                report.orders_marked_missing = missing.marked;
                report.orders_promoted = missing.promoted;
            }
            Ok(None) => {}
            Err(e) if e.is_transient() => {
                warn!(robot_id, "Open-orders sync failed: {}", e)
            }
            Err(e) => return Err(e),
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_guard_serializes_per_robot() {
        let running = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let first = InProgressGuard::try_acquire(&running, 1);
        assert!(first.is_some());
        assert!(InProgressGuard::try_acquire(&running, 1).is_none());
        assert!(InProgressGuard::try_acquire(&running, 2).is_some());

        drop(first);
        assert!(InProgressGuard::try_acquire(&running, 1).is_some());
    }

    #[test]
    fn test_error_classification() {
        let transient = ReconciliationError::Exchange(ExchangeError::Network("reset".into()));
        assert!(transient.is_transient());
        assert!(!transient.is_data_inconsistency());

        let missing = ReconciliationError::MissingRobot(4);
        assert!(!missing.is_transient());
        assert!(missing.is_data_inconsistency());
    }

    #[tokio::test]
    async fn test_trigger_drops_when_queue_full() {
        let (trigger, _rx) = ReconcileTrigger::channel(1);
        assert!(trigger.request(1));
        assert!(!trigger.request(2));
        assert_eq!(trigger.dropped(), 1);
    }
}

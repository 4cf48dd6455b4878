//! Robot Supervisor
//!
//! Owns the running engines and keeps them equal to the persisted desired
//! state. A slow loop applies schedules and runtime limits, starts and stops
//! engines, and acquires or releases their stream subscriptions. A second
//! loop health-checks engines with bounded concurrency.

use super::private_stream_manager::PrivateStreamManager;
use super::reconciliation::ReconciliationService;
use super::robot_engine::{EngineRegistry, RobotEngine};
use crate::config::SyncConfig;
use crate::domain::entities::market::Position;
use crate::domain::entities::platform::canonical_symbol;
use crate::domain::entities::robot::{Robot, RobotStatus};
use crate::domain::errors::CredentialError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError};
use crate::infrastructure::exchange_session_manager::{ExchangeSessionManager, SessionError};
use crate::persistence::robot_repository::RobotRepository;
use crate::persistence::DatabaseError;
use crate::task_runner::{run_supervised, RestartPolicy, TaskExit};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Position poll period while waiting for close-all to flatten
pub const CLOSE_ALL_POLL: Duration = Duration::from_millis(400);

pub const SCHEDULE_STOP_REASON: &str = "schedule_stop";
pub const MAX_RUNTIME_REASON: &str = "max_runtime_expired";
pub const MANUAL_STOP_REASON: &str = "manual_stop";

#[derive(Debug, Error)]
pub enum CloseAllError {
    #[error("Positions still open after timeout: {residual}")]
    Timeout { residual: usize },

    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Close-all failed: {0}")]
    CloseAll(#[from] CloseAllError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Robot not found: {0}")]
    MissingRobot(i64),
}

/// What one desired-state pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct DesiredStateReport {
    pub scheduled_starts: Vec<i64>,
    pub scheduled_stops: Vec<i64>,
    pub runtime_expired: Vec<i64>,
    pub engines_started: Vec<i64>,
    pub engines_stopped: Vec<i64>,
}

/// What a credential refresh rebuilt
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialRefresh {
    pub session_invalidated: bool,
    pub stream_reconnected: bool,
    pub engines_restarted: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub failed: Vec<i64>,
}

struct RunningEngine {
    engine: Arc<RobotEngine>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<TaskExit>,
    streamed: bool,
}

pub struct RobotSupervisor {
    robots: Arc<RobotRepository>,
    sessions: Arc<ExchangeSessionManager>,
    engines: Arc<EngineRegistry>,
    reconciliation: Arc<ReconciliationService>,
    streams: Arc<PrivateStreamManager>,
    config: SyncConfig,
    running: Mutex<HashMap<i64, RunningEngine>>,
    pass_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RobotSupervisor {
    pub fn new(
        robots: Arc<RobotRepository>,
        sessions: Arc<ExchangeSessionManager>,
        engines: Arc<EngineRegistry>,
        reconciliation: Arc<ReconciliationService>,
        streams: Arc<PrivateStreamManager>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            robots,
            sessions,
            engines,
            reconciliation,
            streams,
            config,
            running: Mutex::new(HashMap::new()),
            pass_lock: Mutex::new(()),
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the stream dispatcher, the reconciliation and fill-sync loops and
    /// both supervisor loops
    pub async fn start(self: &Arc<Self>) {
        self.streams.start().await;

        let mut background = self.background.lock().await;

        let reconciliation = self.reconciliation.clone();
        let shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            reconciliation.run(shutdown).await;
        }));

        let supervisor = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            let loop_shutdown = shutdown.clone();
            run_supervised("desired-state", RestartPolicy::default(), shutdown, move || {
                let supervisor = supervisor.clone();
                let shutdown = loop_shutdown.clone();
                async move { supervisor.desired_state_loop(shutdown).await }
            })
            .await;
        }));

        let reconciliation = self.reconciliation.clone();
        let shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            let loop_shutdown = shutdown.clone();
            run_supervised("trade-fill-sync", RestartPolicy::default(), shutdown, move || {
                let reconciliation = reconciliation.clone();
                let shutdown = loop_shutdown.clone();
                async move { reconciliation.run_fill_sync(shutdown).await }
            })
            .await;
        }));

        let supervisor = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move {
            let loop_shutdown = shutdown.clone();
            run_supervised("engine-health", RestartPolicy::default(), shutdown, move || {
                let supervisor = supervisor.clone();
                let shutdown = loop_shutdown.clone();
                async move { supervisor.health_loop(shutdown).await }
            })
            .await;
        }));

        info!(
            "Robot supervisor started (desired state every {:?}, health every {:?})",
            self.config.desired_state_poll, self.config.health_check_interval
        );
    }

    /// Stop the loops, then the engines and their subscriptions, then the streams
    pub async fn stop(&self) {
        info!("Robot supervisor stopping");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Supervisor background task ended abnormally: {}", e);
            }
        }

        let _pass = self.pass_lock.lock().await;
        let ids: Vec<i64> = self.running.lock().await.keys().copied().collect();
        for robot_id in ids {
            self.stop_engine(robot_id).await;
        }

        self.streams.shutdown().await;
        info!("Robot supervisor stopped");
    }

    async fn desired_state_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), String> {
        let mut ticker = tokio::time::interval(self.config.desired_state_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_desired_state_pass().await {
                        warn!("Desired-state pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), String> {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; engines have only just started
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_health_pass().await;
                    if !report.failed.is_empty() {
                        warn!(
                            "Health check failed for {} of {} engines: {:?}",
                            report.failed.len(),
                            report.checked,
                            report.failed
                        );
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    /// Apply schedules and runtime limits, then match engines to the RUNNING set.
    ///
    /// Robots paused by the pass are flattened after the pass lock is
    /// released, a bounded number at a time; the call returns once every
    /// close-all has finished or timed out.
    pub async fn run_desired_state_pass(&self) -> Result<DesiredStateReport, SupervisorError> {
        let mut report = DesiredStateReport::default();
        let mut pausing = Vec::new();
        {
            let _pass = self.pass_lock.lock().await;
            let now = Utc::now();

            for robot in self.robots.list_by_status(RobotStatus::NotStarted).await? {
                if robot.schedule_start.is_some_and(|at| at <= now) {
                    self.robots.mark_started(robot.id, now).await?;
                    info!(robot_id = robot.id, "Scheduled start reached");
                    report.scheduled_starts.push(robot.id);
                }
            }

            for robot in self.robots.list_by_status(RobotStatus::Running).await? {
                let reason = if robot.schedule_stop.is_some_and(|at| at <= now) {
                    report.scheduled_stops.push(robot.id);
                    SCHEDULE_STOP_REASON
                } else if robot.runtime_expired(now) {
                    report.runtime_expired.push(robot.id);
                    MAX_RUNTIME_REASON
                } else {
                    continue;
                };

                self.robots.mark_paused(robot.id, now).await?;
                info!(robot_id = robot.id, "Pausing robot: {}", reason);
                if self.stop_engine(robot.id).await {
                    report.engines_stopped.push(robot.id);
                }
                pausing.push((robot, reason));
            }

            let running = self.robots.list_by_status(RobotStatus::Running).await?;
            self.sync_engines(&running, &mut report).await;
        }

        self.close_all_paused(&pausing).await;

        if !report.engines_started.is_empty() || !report.engines_stopped.is_empty() {
            info!(
                "Desired-state pass: started {:?}, stopped {:?}",
                report.engines_started, report.engines_stopped
            );
        }
        Ok(report)
    }

    async fn close_all_paused(&self, pausing: &[(Robot, &'static str)]) {
        if pausing.is_empty() {
            return;
        }
        let permits = Semaphore::new(self.config.reconcile_concurrency.max(1));
        let closes = pausing.iter().map(|(robot, reason)| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await.ok();
                if let Err(e) = self.close_all_and_wait(robot, reason).await {
                    error!(robot_id = robot.id, "Close-all ({}) incomplete: {}", reason, e);
                }
            }
        });
        join_all(closes).await;
    }

    async fn sync_engines(&self, running: &[Robot], report: &mut DesiredStateReport) {
        let desired: HashSet<i64> = running.iter().map(|r| r.id).collect();

        for robot in running {
            let existing = self
                .running
                .lock()
                .await
                .get(&robot.id)
                .map(|entry| entry.engine.clone());
            match existing {
                Some(engine) => engine.update_robot(robot.clone()).await,
                None => match self.start_engine(robot).await {
                    Ok(()) => report.engines_started.push(robot.id),
                    Err(e) => warn!(robot_id = robot.id, "Engine start failed: {}", e),
                },
            }
        }

        let extra: Vec<i64> = self
            .running
            .lock()
            .await
            .keys()
            .filter(|id| !desired.contains(id))
            .copied()
            .collect();
        for robot_id in extra {
            if self.stop_engine(robot_id).await {
                report.engines_stopped.push(robot_id);
            }
        }
    }

    async fn start_engine(&self, robot: &Robot) -> Result<(), SupervisorError> {
        let client = self.sessions.get(robot.credential_id).await?;
        let engine = Arc::new(RobotEngine::new(
            robot.clone(),
            client,
            self.reconciliation.orders().clone(),
            self.reconciliation.trigger(),
            &self.config,
        ));
        self.engines.insert(engine.clone()).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task_name = format!("robot-engine-{}", robot.id);
        let task_engine = engine.clone();
        let engine_stop = stop_rx.clone();
        let task = tokio::spawn(async move {
            run_supervised(&task_name, RestartPolicy::default(), stop_rx, move || {
                let engine = task_engine.clone();
                let stop = engine_stop.clone();
                async move { engine.run(stop).await }
            })
            .await
        });

        let streamed = match self.sessions.credentials().load(robot.credential_id).await {
            Ok(credential) => self.streams.acquire(&credential, &robot.symbol, robot.id).await,
            Err(e) => {
                warn!(robot_id = robot.id, "No stream subscription, credential unavailable: {}", e);
                false
            }
        };

        self.running.lock().await.insert(
            robot.id,
            RunningEngine {
                engine,
                stop_tx,
                task,
                streamed,
            },
        );
        self.reconciliation
            .invalidate_robot_meta(robot.platform, robot.credential_id)
            .await;
        self.reconciliation.trigger().request(robot.id);

        info!(
            robot_id = robot.id,
            platform = %robot.platform,
            "Engine started for {} (streaming: {})",
            canonical_symbol(&robot.symbol),
            streamed
        );
        Ok(())
    }

    /// Signal the engine, wait for it, release its subscription
    async fn stop_engine(&self, robot_id: i64) -> bool {
        let Some(entry) = self.running.lock().await.remove(&robot_id) else {
            return false;
        };

        let _ = entry.stop_tx.send(true);
        match entry.task.await {
            Ok(exit) => debug!(robot_id, "Engine task exited: {:?}", exit),
            Err(e) => error!(robot_id, "Engine task ended abnormally: {}", e),
        }
        self.engines.remove(robot_id).await;

        let robot = entry.engine.robot().await;
        if entry.streamed {
            self.streams
                .release(robot.platform, robot.credential_id, &robot.symbol, robot_id)
                .await;
        }
        self.reconciliation
            .invalidate_robot_meta(robot.platform, robot.credential_id)
            .await;

        info!(robot_id, "Engine stopped");
        true
    }

    pub async fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.running.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel resting orders, close every open leg and wait until the exchange is flat.
    ///
    /// Works with or without a running engine.
    pub async fn close_all_and_wait(&self, robot: &Robot, reason: &str) -> Result<(), CloseAllError> {
        let deadline = Instant::now() + self.config.close_all_timeout;
        let client = self.sessions.get(robot.credential_id).await?;
        let orders = self.reconciliation.orders();

        for order in client.get_open_orders(&robot.symbol).await? {
            if let Err(e) = client.cancel_order(&robot.symbol, &order.order_id).await {
                warn!(robot_id = robot.id, "Cancel of {} failed: {}", order.order_id, e);
            }
        }

        for position in open_positions(client.as_ref(), robot).await? {
            match client
                .close_position(&robot.symbol, position.side, position.amount.abs())
                .await
            {
                Ok(order) => {
                    if let Some(row) = orders.find_open(robot.id, position.side).await? {
                        orders
                            .mark_close_requested(row.id, Some(&order.order_id), reason)
                            .await?;
                    }
                }
                Err(e) => warn!(
                    robot_id = robot.id,
                    "Close of {} leg failed: {}", position.side, e
                ),
            }
        }

        loop {
            let residual = open_positions(client.as_ref(), robot).await?;
            if residual.is_empty() {
                self.reconciliation.trigger().request(robot.id);
                info!(robot_id = robot.id, "All positions closed ({})", reason);
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.reconciliation.trigger().request(robot.id);
                return Err(CloseAllError::Timeout {
                    residual: residual.len(),
                });
            }
            sleep(CLOSE_ALL_POLL).await;
        }
    }

    /// Health-check every engine, at most `reconcile_concurrency` at once
    pub async fn run_health_pass(&self) -> HealthReport {
        let engines = self.engines.all().await;
        let semaphore = Arc::new(Semaphore::new(self.config.reconcile_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for engine in engines {
            let permits = semaphore.clone();
            let sessions = self.sessions.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let result = engine.health_check().await;
                if let Err(ExchangeError::Authentication(_)) = &result {
                    let credential_id = engine.robot().await.credential_id;
                    sessions.invalidate(credential_id).await;
                }
                (engine.robot_id(), result)
            });
        }

        let mut report = HealthReport::default();
        while let Some(joined) = tasks.join_next().await {
            report.checked += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((robot_id, Err(e))) => {
                    warn!(robot_id, "Engine health check failed: {}", e);
                    report.failed.push(robot_id);
                }
                Err(e) => error!("Health check task ended abnormally: {}", e),
            }
        }
        report.failed.sort_unstable();
        report
    }

    /// Rebuild everything holding the credential's key material: engines
    /// using it are stopped, the cached session is dropped, a stream still
    /// subscribed by others is reconnected, then the engines start again.
    pub async fn refresh_credential(
        &self,
        credential_id: i64,
    ) -> Result<CredentialRefresh, SupervisorError> {
        let _pass = self.pass_lock.lock().await;
        let mut refresh = CredentialRefresh::default();

        let engines: Vec<(i64, Arc<RobotEngine>)> = self
            .running
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.engine.clone()))
            .collect();
        let mut affected = Vec::new();
        for (robot_id, engine) in engines {
            if engine.robot().await.credential_id == credential_id {
                affected.push(robot_id);
            }
        }
        affected.sort_unstable();
        for robot_id in &affected {
            self.stop_engine(*robot_id).await;
        }

        refresh.session_invalidated = self.sessions.invalidate(credential_id).await;
        let credential = self
            .sessions
            .credentials()
            .load(credential_id)
            .await?;
        refresh.stream_reconnected = self.streams.reconnect(&credential).await;

        for robot_id in affected {
            let Some(robot) = self.robots.get(robot_id).await? else {
                continue;
            };
            if robot.status != RobotStatus::Running {
                continue;
            }
            match self.start_engine(&robot).await {
                Ok(()) => refresh.engines_restarted.push(robot_id),
                Err(e) => warn!(robot_id, "Engine restart after credential refresh failed: {}", e),
            }
        }

        info!(
            credential_id,
            "Credential refreshed: session {}, stream {}, engines {:?}",
            refresh.session_invalidated,
            refresh.stream_reconnected,
            refresh.engines_restarted
        );
        Ok(refresh)
    }

    pub async fn start_robot(&self, robot_id: i64) -> Result<DesiredStateReport, SupervisorError> {
        self.robots
            .get(robot_id)
            .await?
            .ok_or(SupervisorError::MissingRobot(robot_id))?;
        self.robots.mark_started(robot_id, Utc::now()).await?;
        self.run_desired_state_pass().await
    }

    /// Pause the robot, stop its engine and flatten its positions
    pub async fn stop_robot(&self, robot_id: i64, reason: &str) -> Result<(), SupervisorError> {
        let robot = self
            .robots
            .get(robot_id)
            .await?
            .ok_or(SupervisorError::MissingRobot(robot_id))?;
        self.robots.mark_paused(robot_id, Utc::now()).await?;
        self.stop_engine(robot_id).await;
        self.close_all_and_wait(&robot, reason).await?;
        self.run_desired_state_pass().await?;
        Ok(())
    }
}

async fn open_positions(
    client: &dyn ExchangeClient,
    robot: &Robot,
) -> Result<Vec<Position>, ExchangeError> {
    let symbol = canonical_symbol(&robot.symbol);
    Ok(client
        .get_positions(&robot.symbol)
        .await?
        .into_iter()
        .filter(|p| p.is_open() && canonical_symbol(&p.symbol) == symbol)
        .collect())
}

//! Robot Engine
//!
//! One engine per running robot. Each tick feeds the ticker into the price
//! window, runs the per-leg trackers (stop loss, profit retreat) and opens a
//! leg when the window signal turns. Orders are written to the ledger as
//! PENDING before submission; reconciliation finalizes them.

use super::reconciliation::ReconcileTrigger;
use crate::config::SyncConfig;
use crate::domain::entities::market::{Balance, Position};
use crate::domain::entities::order::{LedgerSource, LedgerStatus, PositionSide};
use crate::domain::entities::platform::canonical_symbol;
use crate::domain::entities::robot::{MarketState, RiskParams, Robot};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError, OrderRequest};
use crate::domain::services::position_events::PositionUpdate;
use crate::domain::services::position_tracker::{
    realtime_pnl, FrozenRisk, PositionTracker, TrackerDecision,
};
use crate::domain::services::price_window::{PriceWindow, WindowStats};
use crate::domain::services::signal::{evaluate_window_signal, SignalDirection, WindowSignal};
use crate::persistence::models::{NewOrder, OrderRecord};
use crate::persistence::order_repository::OrderRepository;
use crate::persistence::DatabaseError;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Positions and balance older than this are refetched
pub const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(10);

/// A leg with a close in flight is not re-evaluated for this long
pub const CLOSE_SUPPRESSION: Duration = Duration::from_secs(10);

pub const STOP_LOSS_REASON: &str = "stop_loss";
pub const PROFIT_RETREAT_REASON: &str = "profit_retreat";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Outcome of one order submission
#[derive(Debug, Clone, Serialize)]
pub struct OrderSubmission {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
    pub order_id: Option<String>,
}

impl OrderSubmission {
    fn failed(message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: started.elapsed().as_millis() as u64,
            order_id: None,
        }
    }
}

/// Point-in-time view of an engine for status endpoints and logs
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub robot_id: i64,
    pub symbol: String,
    pub market_state: MarketState,
    pub last_price: Option<f64>,
    pub window: Option<WindowStats>,
    pub last_signal: Option<WindowSignal>,
    pub positions: Vec<Position>,
    pub trackers: Vec<PositionTracker>,
    pub ticks: u64,
}

struct EngineState {
    market_state: MarketState,
    window: PriceWindow,
    last_direction: Option<SignalDirection>,
    last_signal: Option<WindowSignal>,
    trackers: HashMap<PositionSide, PositionTracker>,
    positions: Vec<Position>,
    positions_at: Option<Instant>,
    balance: Option<Balance>,
    balance_at: Option<Instant>,
    closing: HashMap<PositionSide, Instant>,
    last_price: Option<f64>,
    ticks: u64,
}

impl EngineState {
    fn position(&self, side: PositionSide) -> Option<&Position> {
        self.positions.iter().find(|p| p.side == side && p.is_open())
    }

    fn is_closing(&self, side: PositionSide) -> bool {
        self.closing
            .get(&side)
            .is_some_and(|at| at.elapsed() < CLOSE_SUPPRESSION)
    }

    fn positions_fresh(&self) -> bool {
        self.positions_at
            .is_some_and(|at| at.elapsed() < ACCOUNT_CACHE_TTL)
    }
}

pub struct RobotEngine {
    robot_id: i64,
    robot: RwLock<Robot>,
    client: Arc<dyn ExchangeClient>,
    orders: Arc<OrderRepository>,
    trigger: ReconcileTrigger,
    tick_interval: Duration,
    state: Mutex<EngineState>,
}

impl RobotEngine {
    pub fn new(
        robot: Robot,
        client: Arc<dyn ExchangeClient>,
        orders: Arc<OrderRepository>,
        trigger: ReconcileTrigger,
        config: &SyncConfig,
    ) -> Self {
        let market_state = robot.default_market_state;
        let window_secs = robot
            .risk_profile
            .params_for(market_state)
            .map(|p| p.window_secs)
            .unwrap_or(60);

        Self {
            robot_id: robot.id,
            robot: RwLock::new(robot),
            client,
            orders,
            trigger,
            tick_interval: config.engine_tick,
            state: Mutex::new(EngineState {
                market_state,
                window: PriceWindow::new(window_secs),
                last_direction: None,
                last_signal: None,
                trackers: HashMap::new(),
                positions: Vec::new(),
                positions_at: None,
                balance: None,
                balance_at: None,
                closing: HashMap::new(),
                last_price: None,
                ticks: 0,
            }),
        }
    }

    pub fn robot_id(&self) -> i64 {
        self.robot_id
    }

    pub async fn robot(&self) -> Robot {
        self.robot.read().await.clone()
    }

    /// Picks up edited robot settings; the symbol and credential are fixed for the engine's life
    pub async fn update_robot(&self, robot: Robot) {
        let mut current = self.robot.write().await;
        if current.symbol != robot.symbol || current.credential_id != robot.credential_id {
            warn!(
                robot_id = self.robot_id,
                "Ignoring symbol/credential change on a running engine"
            );
            return;
        }
        *current = robot;
    }

    pub async fn market_state(&self) -> MarketState {
        self.state.lock().await.market_state
    }

    pub async fn set_market_state(&self, market_state: MarketState) {
        let mut state = self.state.lock().await;
        if state.market_state != market_state {
            info!(
                robot_id = self.robot_id,
                "Market state {} -> {}", state.market_state, market_state
            );
            state.market_state = market_state;
        }
    }

    pub async fn tracked_highest(&self, side: PositionSide) -> Option<f64> {
        self.state
            .lock()
            .await
            .trackers
            .get(&side)
            .map(|t| t.highest_profit)
    }

    pub async fn clear_tracker(&self, side: PositionSide) {
        let mut state = self.state.lock().await;
        state.trackers.remove(&side);
        state.positions.retain(|p| p.side != side);
    }

    /// Align trackers with a reconciled view of positions and OPEN rows.
    ///
    /// A tracker follows its ledger row: a new row id resets it, a leg with
    /// no OPEN row drops it.
    pub async fn apply_reconciliation(&self, positions: &[Position], rows: &[OrderRecord]) {
        let default_risk = self.default_risk().await;
        let mut state = self.state.lock().await;
        state.positions = positions.iter().filter(|p| p.is_open()).cloned().collect();
        state.positions_at = Some(Instant::now());

        for side in PositionSide::BOTH {
            let row = rows.iter().find(|r| r.leg().ok() == Some(side));
            let tracked = state.trackers.get(&side).map(|t| t.order_id);

            match (row, tracked) {
                (None, Some(_)) => {
                    state.trackers.remove(&side);
                    debug!(robot_id = self.robot_id, "Dropped {} tracker, no OPEN row", side);
                }
                (Some(row), Some(None)) => {
                    if let Some(tracker) = state.trackers.get_mut(&side) {
                        tracker.order_id = Some(row.id);
                        if let Some(risk) = row.frozen_risk() {
                            tracker.risk = risk;
                        }
                    }
                }
                (Some(row), Some(Some(id))) if id != row.id => {
                    let risk = row.frozen_risk().unwrap_or_else(|| default_risk.clone());
                    state
                        .trackers
                        .insert(side, PositionTracker::new(side, Some(row.id), row.margin, risk));
                    info!(
                        robot_id = self.robot_id,
                        "Reset {} tracker for ledger row {} (was {})", side, row.id, id
                    );
                }
                (Some(row), None) if state.position(side).is_some() => {
                    let risk = row.frozen_risk().unwrap_or_else(|| default_risk.clone());
                    state
                        .trackers
                        .insert(side, PositionTracker::new(side, Some(row.id), row.margin, risk));
                }
                _ => {}
            }
        }
    }

    /// Positions pushed by the private stream
    pub async fn apply_position_update(&self, update: &PositionUpdate) {
        let symbol = self.robot.read().await.symbol.clone();
        if !update.covers(&symbol) {
            return;
        }
        let mut state = self.state.lock().await;
        state.positions = update.positions_for(&symbol);
        state.positions_at = Some(Instant::now());
    }

    pub async fn apply_balance(&self, balance: Balance) {
        let mut state = self.state.lock().await;
        state.balance = Some(balance);
        state.balance_at = Some(Instant::now());
    }

    /// Cheap authenticated call proving the session still works
    pub async fn health_check(&self) -> Result<(), ExchangeError> {
        let balance = self.client.get_balance().await?;
        self.apply_balance(balance).await;
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let symbol = self.robot.read().await.symbol.clone();
        let state = self.state.lock().await;
        let mut trackers: Vec<PositionTracker> = state.trackers.values().cloned().collect();
        trackers.sort_by_key(|t| t.side);
        EngineStatus {
            robot_id: self.robot_id,
            symbol,
            market_state: state.market_state,
            last_price: state.last_price,
            window: state.window.stats(),
            last_signal: state.last_signal.clone(),
            positions: state.positions.clone(),
            trackers,
            ticks: state.ticks,
        }
    }

    /// Tick until `stop` flips. Database failures end the run so the supervisor restarts it.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<(), String> {
        info!(robot_id = self.robot_id, "Robot engine started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => match self.tick().await {
                    Ok(()) => {}
                    Err(EngineError::Exchange(e)) if e.is_transient() => {
                        debug!(robot_id = self.robot_id, "Tick skipped: {}", e)
                    }
                    Err(EngineError::Exchange(e)) => {
                        warn!(robot_id = self.robot_id, "Tick failed: {}", e)
                    }
                    Err(EngineError::Database(e)) => {
                        return Err(format!("robot {} engine: {}", self.robot_id, e));
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!(robot_id = self.robot_id, "Robot engine stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<(), EngineError> {
        let robot = self.robot().await;
        let price = self.client.get_ticker(&robot.symbol).await?.effective_mark_price();
        if !(price > 0.0) {
            return Ok(());
        }

        let market_state = self.market_state().await;
        let params = match robot.risk_profile.params_for(market_state) {
            Ok(params) => params.clone(),
            Err(e) => {
                error!(robot_id = robot.id, "Tick skipped: {}", e);
                return Ok(());
            }
        };

        self.refresh_positions(&robot).await;

        let closes = {
            let mut state = self.state.lock().await;
            state.ticks += 1;
            state.last_price = Some(price);
            state.window.set_window(params.window_secs);
            state.window.push(Utc::now().timestamp_millis(), price);
            self.evaluate_trackers(&mut state, &robot, price, market_state, &params)
        };
        for (side, reason) in closes {
            self.close_leg(&robot, side, reason).await?;
        }

        let open_side = {
            let mut state = self.state.lock().await;
            let signal = evaluate_window_signal(&state.window, params.threshold);
            let turned = state.last_direction != Some(signal.direction);
            state.last_direction = Some(signal.direction);
            state.last_signal = Some(signal.clone());

            signal.direction.position_side().filter(|side| {
                turned
                    && state.position(*side).is_none()
                    && !state.trackers.contains_key(side)
                    && !state.is_closing(*side)
            })
        };

        if let Some(side) = open_side {
            if let Some(row) = self.orders.find_open(robot.id, side).await? {
                debug!(
                    robot_id = robot.id,
                    "{} signal ignored, ledger row {} is OPEN", side, row.id
                );
                return Ok(());
            }
            let submission = self
                .open_leg(&robot, side, &params, market_state, price)
                .await;
            if submission.success {
                info!(
                    robot_id = robot.id,
                    latency_ms = submission.latency_ms,
                    "Opened {}: {}", side, submission.message
                );
            } else {
                warn!(robot_id = robot.id, "Open {} failed: {}", side, submission.message);
            }
        }
        Ok(())
    }

    fn evaluate_trackers(
        &self,
        state: &mut EngineState,
        robot: &Robot,
        price: f64,
        market_state: MarketState,
        params: &RiskParams,
    ) -> Vec<(PositionSide, &'static str)> {
        let leverage = robot.effective_leverage();
        let mut closes = Vec::new();

        for position in state.positions.clone() {
            let side = position.side;
            if !position.is_open() || state.is_closing(side) {
                continue;
            }
            let margin = position.effective_margin(leverage);
            let tracker = state.trackers.entry(side).or_insert_with(|| {
                PositionTracker::new(side, None, margin, FrozenRisk::capture(params, market_state))
            });

            let pnl = if position.entry_price > 0.0 {
                realtime_pnl(side, position.entry_price, price, position.amount.abs())
            } else {
                position.unrealized_pnl
            };

            match tracker.observe(pnl, margin) {
                TrackerDecision::Hold => {}
                TrackerDecision::StopLoss { progress } => {
                    warn!(
                        robot_id = robot.id,
                        "{} stop loss hit: pnl {:.4}, {:.1}% of allowed loss", side, pnl, progress
                    );
                    closes.push((side, STOP_LOSS_REASON));
                }
                TrackerDecision::ProfitRetreat {
                    retreat_percent,
                    peak,
                } => {
                    info!(
                        robot_id = robot.id,
                        "{} profit retreat {:.1}% from peak {:.4}", side, retreat_percent, peak
                    );
                    closes.push((side, PROFIT_RETREAT_REASON));
                }
            }
        }
        closes
    }

    async fn refresh_positions(&self, robot: &Robot) {
        if self.state.lock().await.positions_fresh() {
            return;
        }
        let symbol = canonical_symbol(&robot.symbol);
        match self.client.get_positions(&robot.symbol).await {
            Ok(positions) => {
                let mut state = self.state.lock().await;
                state.positions = positions
                    .into_iter()
                    .filter(|p| p.is_open() && canonical_symbol(&p.symbol) == symbol)
                    .collect();
                state.positions_at = Some(Instant::now());
            }
            Err(e) => warn!(robot_id = robot.id, "Position refresh failed: {}", e),
        }
    }

    async fn balance(&self) -> Result<Balance, ExchangeError> {
        {
            let state = self.state.lock().await;
            if let (Some(balance), Some(at)) = (&state.balance, state.balance_at) {
                if at.elapsed() < ACCOUNT_CACHE_TTL {
                    return Ok(balance.clone());
                }
            }
        }
        let balance = self.client.get_balance().await?;
        self.apply_balance(balance.clone()).await;
        Ok(balance)
    }

    async fn default_risk(&self) -> FrozenRisk {
        let market_state = self.market_state().await;
        let robot = self.robot.read().await;
        match robot.risk_profile.params_for(market_state) {
            Ok(params) => FrozenRisk::capture(params, market_state),
            Err(_) => FrozenRisk::fallback(market_state),
        }
    }

    /// Submit a market open for `side` sized from available balance
    pub async fn open_leg(
        &self,
        robot: &Robot,
        side: PositionSide,
        params: &RiskParams,
        market_state: MarketState,
        price: f64,
    ) -> OrderSubmission {
        let started = Instant::now();
        let balance = match self.balance().await {
            Ok(balance) => balance,
            Err(e) => return OrderSubmission::failed(format!("balance unavailable: {}", e), started),
        };

        let leverage = robot.effective_leverage();
        let margin = balance.available * params.margin_percent / 100.0;
        let quantity = margin * leverage / price;
        if !(quantity > 0.0) || !quantity.is_finite() {
            return OrderSubmission::failed("insufficient available balance", started);
        }

        let client_order_id = new_client_order_id(robot.id);
        let risk = FrozenRisk::capture(params, market_state);
        let row = NewOrder {
            robot_id: robot.id,
            credential_id: robot.credential_id,
            platform: robot.platform,
            symbol: canonical_symbol(&robot.symbol),
            exchange_order_id: None,
            client_order_id: Some(client_order_id.clone()),
            side: side.opening_side(),
            position_side: side,
            order_type: "MARKET".to_string(),
            price,
            quantity,
            filled_quantity: 0.0,
            avg_price: 0.0,
            leverage,
            margin,
            status: LedgerStatus::Pending,
            raw_status: None,
            is_open: true,
            exchange_update_time_ms: None,
            source: LedgerSource::Engine,
            open_fee: None,
            open_fee_currency: None,
            open_time: None,
            frozen_risk: Some(risk.clone()),
        };
        let row_id = match self.orders.insert(&row).await {
            Ok(id) => id,
            Err(e) => return OrderSubmission::failed(format!("ledger write failed: {}", e), started),
        };

        let request = OrderRequest::market_open(&robot.symbol, side, quantity, client_order_id);
        let submission = match self.client.create_order(&request).await {
            Ok(order) => {
                if let Err(e) = self.orders.mark_submitted(row_id, &order).await {
                    error!(robot_id = robot.id, "Failed to record submission of row {}: {}", row_id, e);
                }
                let mut state = self.state.lock().await;
                if order.has_fill() {
                    state
                        .trackers
                        .insert(side, PositionTracker::new(side, Some(row_id), margin, risk));
                }
                state.positions_at = None;
                OrderSubmission {
                    success: true,
                    message: format!("{} {} @ {}", side, quantity, price),
                    latency_ms: started.elapsed().as_millis() as u64,
                    order_id: Some(order.order_id),
                }
            }
            Err(e) => {
                if let Err(db) = self.orders.mark_failed(row_id, &e.to_string()).await {
                    error!(robot_id = robot.id, "Failed to mark row {} failed: {}", row_id, db);
                }
                OrderSubmission::failed(e.to_string(), started)
            }
        };

        self.trigger.request(robot.id);
        submission
    }

    /// Market-close one leg and record the reason on its OPEN row.
    ///
    /// The row itself is closed by reconciliation once the exchange is flat.
    pub async fn close_leg(
        &self,
        robot: &Robot,
        side: PositionSide,
        reason: &str,
    ) -> Result<OrderSubmission, EngineError> {
        let started = Instant::now();
        let row = self.orders.find_open(robot.id, side).await?;
        let cached = self
            .state
            .lock()
            .await
            .position(side)
            .map(|p| p.amount.abs());
        let quantity = cached
            .or_else(|| row.as_ref().map(|r| r.position_quantity()))
            .unwrap_or(0.0);
        if !(quantity > 0.0) {
            return Ok(OrderSubmission::failed("nothing to close", started));
        }

        let order = match self.client.close_position(&robot.symbol, side, quantity).await {
            Ok(order) => order,
            Err(e) => {
                warn!(robot_id = robot.id, "Close {} ({}) failed: {}", side, reason, e);
                return Ok(OrderSubmission::failed(e.to_string(), started));
            }
        };

        if let Some(row) = &row {
            self.orders
                .mark_close_requested(row.id, Some(&order.order_id), reason)
                .await?;
        }
        {
            let mut state = self.state.lock().await;
            state.trackers.remove(&side);
            state.positions.retain(|p| p.side != side);
            state.closing.insert(side, Instant::now());
        }
        self.trigger.request(robot.id);

        info!(
            robot_id = robot.id,
            "Close {} requested ({}), exchange order {}", side, reason, order.order_id
        );
        Ok(OrderSubmission {
            success: true,
            message: format!("closed {} {}", side, quantity),
            latency_ms: started.elapsed().as_millis() as u64,
            order_id: Some(order.order_id),
        })
    }
}

/// Venue-safe client order id: alphanumeric, at most 32 chars
fn new_client_order_id(robot_id: i64) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("rb{}x{}{:04}", robot_id, Utc::now().timestamp_millis(), suffix)
}

/// Live engines by robot id
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<i64, Arc<RobotEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the engine it replaced, if any
    pub async fn insert(&self, engine: Arc<RobotEngine>) -> Option<Arc<RobotEngine>> {
        self.engines.write().await.insert(engine.robot_id(), engine)
    }

    pub async fn remove(&self, robot_id: i64) -> Option<Arc<RobotEngine>> {
        self.engines.write().await.remove(&robot_id)
    }

    pub async fn get(&self, robot_id: i64) -> Option<Arc<RobotEngine>> {
        self.engines.read().await.get(&robot_id).cloned()
    }

    pub async fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.engines.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn all(&self) -> Vec<Arc<RobotEngine>> {
        self.engines.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.engines.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::{ExchangeOrder, Ticker};
    use crate::domain::entities::platform::Platform;
    use crate::domain::entities::robot::{RiskProfile, RobotStatus};
    use crate::domain::repositories::exchange_client::{ExchangeResult, TradeHistoryProvider};
    use crate::persistence::init_database;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockExchange {
        prices: StdMutex<VecDeque<f64>>,
        positions: StdMutex<Vec<Position>>,
        created: StdMutex<Vec<OrderRequest>>,
        closed: StdMutex<Vec<(PositionSide, f64)>>,
    }

    impl MockExchange {
        fn with_prices(prices: &[f64]) -> Self {
            let mock = Self::default();
            mock.prices.lock().unwrap().extend(prices.iter().copied());
            mock
        }
    }

    fn filled(order_id: &str, side: PositionSide, quantity: f64, reduce_only: bool) -> ExchangeOrder {
        ExchangeOrder {
            order_id: order_id.to_string(),
            client_order_id: None,
            symbol: "BTCUSDT".to_string(),
            side: if reduce_only { side.closing_side() } else { side.opening_side() },
            position_side: Some(side),
            order_type: "MARKET".to_string(),
            reduce_only,
            price: 0.0,
            quantity,
            filled_quantity: quantity,
            avg_price: 100.0,
            raw_status: "filled".to_string(),
            status: "FILLED".to_string(),
            is_open: false,
            create_time_ms: 1_700_000_000_000,
            update_time_ms: 1_700_000_000_000,
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        fn platform(&self) -> Platform {
            Platform::Okx
        }

        async fn get_balance(&self) -> ExchangeResult<Balance> {
            Ok(Balance {
                currency: "USDT".to_string(),
                available: 1000.0,
                total: 1000.0,
            })
        }

        async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
            let mut prices = self.prices.lock().unwrap();
            let price = if prices.len() > 1 {
                prices.pop_front().unwrap_or(0.0)
            } else {
                prices.front().copied().unwrap_or(0.0)
            };
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: price,
                mark_price: None,
                timestamp_ms: 0,
            })
        }

        async fn get_positions(&self, _symbol: &str) -> ExchangeResult<Vec<Position>> {
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn get_open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>> {
            Ok(Vec::new())
        }

        async fn get_order_history(
            &self,
            _symbol: &str,
            _limit: usize,
        ) -> ExchangeResult<Vec<ExchangeOrder>> {
            Ok(Vec::new())
        }

        async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
            let mut created = self.created.lock().unwrap();
            created.push(request.clone());
            Ok(filled(
                &format!("EX{}", created.len()),
                request.position_side,
                request.quantity,
                false,
            ))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<()> {
            Ok(())
        }

        async fn close_position(
            &self,
            _symbol: &str,
            side: PositionSide,
            quantity: f64,
        ) -> ExchangeResult<ExchangeOrder> {
            self.closed.lock().unwrap().push((side, quantity));
            Ok(filled("CLOSE1", side, quantity, true))
        }

        fn trade_history(&self) -> Option<&dyn TradeHistoryProvider> {
            None
        }
    }

    fn params() -> RiskParams {
        RiskParams {
            window_secs: 60,
            threshold: 1.5,
            stop_loss_percent: 10.0,
            auto_start_retreat_percent: 5.0,
            profit_retreat_percent: 30.0,
            margin_percent: 10.0,
        }
    }

    fn robot(profile: RiskProfile) -> Robot {
        Robot {
            id: 7,
            name: "breakout".to_string(),
            credential_id: 3,
            platform: Platform::Okx,
            symbol: "BTCUSDT".to_string(),
            status: RobotStatus::Running,
            leverage: 10.0,
            max_runtime_secs: None,
            schedule_start: None,
            schedule_stop: None,
            start_time: None,
            pause_time: None,
            default_market_state: MarketState::Trend,
            total_profit: 0.0,
            risk_profile: profile,
        }
    }

    async fn engine(
        exchange: Arc<MockExchange>,
        profile: RiskProfile,
    ) -> (Arc<RobotEngine>, Arc<OrderRepository>, tokio::sync::mpsc::Receiver<i64>) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let orders = Arc::new(OrderRepository::new(pool));
        let (trigger, rx) = ReconcileTrigger::channel(16);
        let engine = RobotEngine::new(
            robot(profile),
            exchange,
            orders.clone(),
            trigger,
            &SyncConfig::default(),
        );
        (Arc::new(engine), orders, rx)
    }

    #[tokio::test]
    async fn test_breakout_opens_once_and_records_ledger_row() {
        let exchange = Arc::new(MockExchange::with_prices(&[100.0, 100.0, 102.0, 103.0]));
        let (engine, orders, mut triggers) =
            engine(exchange.clone(), RiskProfile::uniform(params())).await;

        for _ in 0..4 {
            engine.tick().await.unwrap();
        }

        let created = exchange.created.lock().unwrap().clone();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].position_side, PositionSide::Long);
        // 1000 available * 10% margin * 10x leverage / 102
        assert!((created[0].quantity - 1000.0 / 102.0).abs() < 1e-9);

        let row = orders.find_open(7, PositionSide::Long).await.unwrap().unwrap();
        assert_eq!(row.exchange_order_id.as_deref(), Some("EX1"));
        assert_eq!(row.source, "engine");
        assert!(engine.tracked_highest(PositionSide::Long).await.is_some());
        assert_eq!(triggers.try_recv().ok(), Some(7));
    }

    #[tokio::test]
    async fn test_stop_loss_requests_close_with_reason() {
        let exchange = Arc::new(MockExchange::with_prices(&[49_000.0]));
        let position = Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            amount: 0.01,
            entry_price: 50_000.0,
            mark_price: 50_000.0,
            unrealized_pnl: 0.0,
            leverage: 10.0,
            margin: 50.0,
            margin_mode: "cross".to_string(),
        };
        exchange.positions.lock().unwrap().push(position.clone());
        let (engine, orders, _triggers) =
            engine(exchange.clone(), RiskProfile::uniform(params())).await;

        let mut open = filled("OPEN1", PositionSide::Long, 0.01, false);
        open.avg_price = 50_000.0;
        orders
            .upsert_from_exchange(7, 3, Platform::Okx, &open, LedgerSource::OrderHistory, None)
            .await
            .unwrap();
        let rows = orders.open_rows(7).await.unwrap();
        engine.apply_reconciliation(&[position], &rows).await;

        engine.tick().await.unwrap();

        assert_eq!(exchange.closed.lock().unwrap().as_slice(), &[(PositionSide::Long, 0.01)]);
        let row = orders.get(rows[0].id).await.unwrap().unwrap();
        assert_eq!(row.close_reason.as_deref(), Some(STOP_LOSS_REASON));
        assert_eq!(row.close_order_id.as_deref(), Some("CLOSE1"));
        assert_eq!(engine.tracked_highest(PositionSide::Long).await, None);

        // The close is in flight: the next tick must not close again
        engine.tick().await.unwrap();
        assert_eq!(exchange.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_risk_params_skip_the_tick() {
        let exchange = Arc::new(MockExchange::with_prices(&[100.0, 110.0]));
        let profile = RiskProfile::new().with(MarketState::Volatile, params());
        let (engine, _orders, _triggers) = engine(exchange.clone(), profile).await;

        engine.tick().await.unwrap();
        engine.tick().await.unwrap();

        assert!(exchange.created.lock().unwrap().is_empty());
        assert_eq!(engine.status().await.ticks, 0);
    }

    #[tokio::test]
    async fn test_reconciliation_drops_tracker_without_open_row() {
        let exchange = Arc::new(MockExchange::with_prices(&[100.0]));
        let (engine, _orders, _triggers) =
            engine(exchange, RiskProfile::uniform(params())).await;
        {
            let mut state = engine.state.lock().await;
            state.trackers.insert(
                PositionSide::Short,
                PositionTracker::new(
                    PositionSide::Short,
                    Some(11),
                    50.0,
                    FrozenRisk::fallback(MarketState::Trend),
                ),
            );
        }

        engine.apply_reconciliation(&[], &[]).await;
        assert_eq!(engine.tracked_highest(PositionSide::Short).await, None);
    }

    #[tokio::test]
    async fn test_registry_tracks_engines_by_robot() {
        let exchange = Arc::new(MockExchange::default());
        let (engine, _orders, _triggers) =
            engine(exchange, RiskProfile::uniform(params())).await;
        let registry = EngineRegistry::new();

        assert!(registry.insert(engine.clone()).await.is_none());
        assert_eq!(registry.ids().await, vec![7]);
        assert!(registry.get(7).await.is_some());
        assert!(registry.remove(7).await.is_some());
        assert!(registry.is_empty().await);
    }
}

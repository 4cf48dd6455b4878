//! Shared fixtures for the end-to-end suites: an in-memory ledger, a
//! scriptable exchange and scriptable private streams.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tradebot_sync::config::SyncConfig;
use tradebot_sync::context::AppContext;
use tradebot_sync::domain::entities::credential::{DecryptedCredential, ProxyConfig};
use tradebot_sync::domain::entities::market::{Balance, ExchangeOrder, Position, Ticker, Trade};
use tradebot_sync::domain::entities::order::{OrderSide, PositionSide};
use tradebot_sync::domain::entities::platform::{canonical_symbol, Platform};
use tradebot_sync::domain::entities::robot::{MarketState, RiskParams, RiskProfile, RobotStatus};
use tradebot_sync::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangeResult, OrderRequest, TradeHistoryProvider,
};
use tradebot_sync::domain::repositories::private_stream::{
    EventCallback, PrivateEvent, PrivateEventKind, PrivateStream, PrivateStreamFactory,
    StreamError,
};
use tradebot_sync::infrastructure::exchange_client_factory::ExchangeClientFactory;
use tradebot_sync::persistence::init_database;
use tradebot_sync::persistence::models::{NewCredential, NewRobot};

pub const OPEN_TIME_MS: i64 = 1_700_000_000_000;

#[derive(Default)]
pub struct MockState {
    /// `None` makes `get_ticker` fail with a network error
    pub ticker: Option<f64>,
    pub positions: Vec<Position>,
    pub open_orders: Vec<ExchangeOrder>,
    pub order_history: Vec<ExchangeOrder>,
    pub trades: Vec<Trade>,
    pub trade_history_enabled: bool,
    pub available: f64,
    /// `close_position` removes the position, like a venue filling at market
    pub flatten_on_close: bool,
    pub created: Vec<OrderRequest>,
    pub closed: Vec<(PositionSide, f64)>,
    pub canceled: Vec<String>,
    pub ticker_calls: usize,
    pub trade_history_calls: usize,
}

pub struct MockExchange {
    pub platform: Platform,
    pub state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            state: Mutex::new(MockState {
                available: 1000.0,
                flatten_on_close: true,
                ..Default::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn get_balance(&self) -> ExchangeResult<Balance> {
        let available = self.with(|s| s.available);
        Ok(Balance {
            currency: "USDT".to_string(),
            available,
            total: available,
        })
    }

    async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        let price = self.with(|s| {
            s.ticker_calls += 1;
            s.ticker
        });
        let price = price.ok_or_else(|| ExchangeError::Network("ticker timeout".to_string()))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last_price: price,
            mark_price: Some(price),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    async fn get_positions(&self, symbol: &str) -> ExchangeResult<Vec<Position>> {
        let symbol = canonical_symbol(symbol);
        Ok(self.with(|s| {
            s.positions
                .iter()
                .filter(|p| canonical_symbol(&p.symbol) == symbol)
                .cloned()
                .collect()
        }))
    }

    async fn get_open_orders(&self, _symbol: &str) -> ExchangeResult<Vec<ExchangeOrder>> {
        Ok(self.with(|s| s.open_orders.clone()))
    }

    async fn get_order_history(
        &self,
        _symbol: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<ExchangeOrder>> {
        Ok(self.with(|s| s.order_history.iter().take(limit).cloned().collect()))
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
        let id = self.with(|s| {
            s.created.push(request.clone());
            s.created.len()
        });
        Ok(filled_order(
            &format!("NEW{}", id),
            request.side,
            request.position_side,
            request.quantity,
            request.price.unwrap_or(100.0),
            Utc::now().timestamp_millis(),
        ))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.with(|s| {
            s.canceled.push(order_id.to_string());
            s.open_orders.retain(|o| o.order_id != order_id);
        });
        Ok(())
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
    ) -> ExchangeResult<ExchangeOrder> {
        let n = self.with(|s| {
            s.closed.push((side, quantity));
            if s.flatten_on_close {
                s.positions.retain(|p| p.side != side);
            }
            s.closed.len()
        });
        let mut order = filled_order(
            &format!("CLOSE{}", n),
            side.closing_side(),
            side,
            quantity,
            100.0,
            Utc::now().timestamp_millis(),
        );
        order.symbol = canonical_symbol(symbol);
        order.reduce_only = true;
        Ok(order)
    }

    fn trade_history(&self) -> Option<&dyn TradeHistoryProvider> {
        if self.with(|s| s.trade_history_enabled) {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl TradeHistoryProvider for MockExchange {
    async fn get_trade_history(&self, _symbol: &str, limit: usize) -> ExchangeResult<Vec<Trade>> {
        Ok(self.with(|s| {
            s.trade_history_calls += 1;
            s.trades.iter().take(limit).cloned().collect()
        }))
    }
}

pub struct MockStream {
    pub platform: Platform,
    pub credential_id: i64,
    /// Secret the connection was opened with
    pub secret: String,
    pub symbols: Mutex<HashSet<String>>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub stops: AtomicUsize,
    callback: Mutex<Option<EventCallback>>,
}

impl MockStream {
    /// Deliver an event the way the receive loop would
    pub fn emit(&self, kind: PrivateEventKind, symbol: &str, payload: serde_json::Value) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(PrivateEvent {
                platform: self.platform,
                credential_id: self.credential_id,
                kind,
                symbol: canonical_symbol(symbol),
                payload: serde_json::to_vec(&payload).unwrap(),
                received_at: Utc::now(),
            });
        }
    }

    pub fn symbols(&self) -> HashSet<String> {
        self.symbols.lock().unwrap().clone()
    }
}

#[async_trait]
impl PrivateStream for MockStream {
    async fn start(&self) -> Result<(), StreamError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    async fn add_symbol(&self, symbol: &str) -> Result<(), StreamError> {
        self.symbols.lock().unwrap().insert(canonical_symbol(symbol));
        Ok(())
    }

    async fn remove_symbol(&self, symbol: &str) -> Result<(), StreamError> {
        self.symbols.lock().unwrap().remove(&canonical_symbol(symbol));
        Ok(())
    }

    async fn set_on_event(&self, callback: EventCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn set_proxy(&self, _proxy: Option<ProxyConfig>) {}
}

#[derive(Default)]
pub struct MockStreamFactory {
    pub created: Mutex<Vec<Arc<MockStream>>>,
    pub creations: AtomicUsize,
}

impl MockStreamFactory {
    pub fn latest(&self) -> Option<Arc<MockStream>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn live_count(&self) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_running())
            .count()
    }
}

impl PrivateStreamFactory for MockStreamFactory {
    fn create(&self, credential: &DecryptedCredential) -> Option<Arc<dyn PrivateStream>> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(MockStream {
            platform: credential.platform,
            credential_id: credential.id,
            secret: credential.secret_key.to_string(),
            symbols: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            callback: Mutex::new(None),
        });
        self.created.lock().unwrap().push(stream.clone());
        Some(stream)
    }
}

pub struct Harness {
    pub ctx: AppContext,
    pub exchange: Arc<MockExchange>,
    pub streams: Arc<MockStreamFactory>,
    /// Secret of every credential a client was built from, in order
    pub built_secrets: Arc<Mutex<Vec<String>>>,
    pub credential_id: i64,
    pub platform: Platform,
}

/// Short intervals so loops and debouncers settle within test timeouts
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.poll_interval = Duration::from_millis(200);
    config.platform_poll_intervals.clear();
    config.desired_state_poll = Duration::from_millis(100);
    config.health_check_interval = Duration::from_secs(60);
    config.stream_debounce = Duration::from_millis(50);
    config.trade_backfill_debounce = Duration::from_millis(50);
    config.open_orders_empty_hold = Duration::ZERO;
    config.close_all_timeout = Duration::from_secs(2);
    config.engine_tick = Duration::from_millis(50);
    config.robot_meta_ttl = Duration::from_millis(100);
    config.exchange_requests_per_second = 1000;
    config
}

pub async fn harness(platform: Platform) -> Harness {
    harness_with(platform, fast_config()).await
}

pub async fn harness_with(platform: Platform, config: SyncConfig) -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let exchange = MockExchange::new(platform);
    let streams = Arc::new(MockStreamFactory::default());

    let built_secrets = Arc::new(Mutex::new(Vec::new()));

    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let builds = built_secrets.clone();
    let clients = ExchangeClientFactory::new().with(
        platform,
        Arc::new(move |credential: &DecryptedCredential| {
            builds.lock().unwrap().push(credential.secret_key.to_string());
            Ok(client.clone())
        }),
    );

    let ctx = AppContext::build(pool, config, None, clients, streams.clone());
    let credential_id = ctx
        .credentials
        .insert(&NewCredential {
            platform,
            api_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            passphrase: Some("test-pass".to_string()),
            proxy: None,
        })
        .await
        .unwrap();

    Harness {
        ctx,
        exchange,
        streams,
        built_secrets,
        credential_id,
        platform,
    }
}

pub fn risk_params() -> RiskParams {
    RiskParams {
        window_secs: 60,
        threshold: 1000.0,
        stop_loss_percent: 50.0,
        auto_start_retreat_percent: 5.0,
        profit_retreat_percent: 30.0,
        margin_percent: 10.0,
    }
}

impl Harness {
    pub async fn add_robot(&self, symbol: &str, status: RobotStatus) -> i64 {
        self.add_robot_with(NewRobot {
            name: format!("robot-{}", symbol),
            credential_id: self.credential_id,
            platform: self.platform,
            symbol: symbol.to_string(),
            status,
            leverage: 10.0,
            max_runtime_secs: None,
            schedule_start: None,
            schedule_stop: None,
            start_time: None,
            default_market_state: MarketState::Trend,
        })
        .await
    }

    pub async fn add_robot_with(&self, robot: NewRobot) -> i64 {
        self.ctx
            .robots
            .insert(&robot, &RiskProfile::uniform(risk_params()))
            .await
            .unwrap()
    }

    pub fn built_secrets(&self) -> Vec<String> {
        self.built_secrets.lock().unwrap().clone()
    }

    pub async fn credential(&self) -> DecryptedCredential {
        self.ctx
            .sessions
            .credentials()
            .load(self.credential_id)
            .await
            .unwrap()
    }
}

pub fn position(side: PositionSide, amount: f64, entry: f64, mark: f64) -> Position {
    Position {
        symbol: "BTCUSDT".to_string(),
        side,
        amount,
        entry_price: entry,
        mark_price: mark,
        unrealized_pnl: 0.0,
        leverage: 10.0,
        margin: 0.0,
        margin_mode: "cross".to_string(),
    }
}

pub fn filled_order(
    order_id: &str,
    side: OrderSide,
    position_side: PositionSide,
    quantity: f64,
    avg_price: f64,
    time_ms: i64,
) -> ExchangeOrder {
    ExchangeOrder {
        order_id: order_id.to_string(),
        client_order_id: None,
        symbol: "BTCUSDT".to_string(),
        side,
        position_side: Some(position_side),
        order_type: "MARKET".to_string(),
        reduce_only: false,
        price: 0.0,
        quantity,
        filled_quantity: quantity,
        avg_price,
        raw_status: "filled".to_string(),
        status: "FILLED".to_string(),
        is_open: false,
        create_time_ms: time_ms,
        update_time_ms: time_ms,
    }
}

pub fn closing_trade(order_id: &str, trade_id: &str, price: f64, pnl: f64, time_ms: i64) -> Trade {
    Trade {
        trade_id: Some(trade_id.to_string()),
        order_id: order_id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Sell,
        position_side: Some(PositionSide::Long),
        price,
        quantity: 0.01,
        realized_pnl: pnl,
        fee: 0.2,
        fee_currency: "USDT".to_string(),
        timestamp_ms: time_ms,
    }
}

/// OKX `orders` channel push for one order
pub fn okx_order_push(order_id: &str, state: &str, filled: &str, avg: &str) -> serde_json::Value {
    json!({
        "arg": {"channel": "orders", "instType": "SWAP"},
        "data": [{
            "instId": "BTC-USDT-SWAP", "ordId": order_id,
            "clOrdId": "", "side": "buy", "posSide": "long",
            "ordType": "market", "reduceOnly": "false", "px": "",
            "sz": "0.01", "accFillSz": filled, "avgPx": avg,
            "state": state, "cTime": "1700000000000", "uTime": "1700000000100"
        }]
    })
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

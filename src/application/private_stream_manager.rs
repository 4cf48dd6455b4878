//! Private Stream Manager
//!
//! Multiplexes one authenticated stream per (platform, credential) across every
//! robot and symbol that needs it. Subscriptions are reference counted: the
//! first `acquire` opens the connection, the last `release` stops it.
//!
//! Stream callbacks only enqueue into a bounded queue; a dispatcher task
//! drains it, forwards order events once to the incremental ledger path and
//! fans a debounced reconciliation trigger out to every subscribed robot.

use crate::application::debounce::Debouncer;
use crate::config::SyncConfig;
use crate::domain::entities::credential::DecryptedCredential;
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::repositories::private_stream::{
    EventCallback, PrivateEvent, PrivateEventKind, PrivateStream, PrivateStreamFactory,
    StreamError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consumer of decoded stream events
#[async_trait]
pub trait StreamEventSink: Send + Sync {
    /// Every order event, exactly once, ahead of any debouncing
    async fn apply_order_event(&self, event: &PrivateEvent);

    /// Position and account snapshots for the robots subscribed to the stream
    async fn apply_snapshot(&self, robot_ids: &[i64], event: &PrivateEvent);

    /// Debounced request for one reconciliation pass
    async fn trigger_reconcile(&self, robot_id: i64);
}

type SubscriptionKey = (Platform, i64);

struct Subscription {
    stream: Arc<dyn PrivateStream>,
    ref_count: usize,
    /// canonical symbol -> reference count
    symbols: HashMap<String, usize>,
    /// (robot, canonical symbol) -> reference count
    robots: HashMap<(i64, String), usize>,
}

impl Subscription {
    fn robots_for(&self, symbol: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .robots
            .keys()
            .filter(|(_, s)| symbol.is_empty() || s == symbol)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Counters for status reporting
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StreamManagerStats {
    pub live_subscriptions: usize,
    pub events_received: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
}

pub struct PrivateStreamManager {
    factory: Arc<dyn PrivateStreamFactory>,
    sink: Arc<dyn StreamEventSink>,
    config: SyncConfig,
    subscriptions: RwLock<HashMap<SubscriptionKey, Subscription>>,
    debouncer: Debouncer<i64>,
    queue_tx: mpsc::Sender<PrivateEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<PrivateEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    received: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    filtered: AtomicU64,
}

impl PrivateStreamManager {
    pub fn new(
        factory: Arc<dyn PrivateStreamFactory>,
        sink: Arc<dyn StreamEventSink>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.stream_event_queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            factory,
            sink,
            debouncer: Debouncer::new(config.stream_debounce),
            config,
            subscriptions: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            dispatcher: Mutex::new(None),
            received: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            filtered: AtomicU64::new(0),
        })
    }

    /// Spawn the dispatcher. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let Some(rx) = self.queue_rx.lock().await.take() else {
            return;
        };
        let manager = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { manager.dispatch_loop(rx, shutdown).await });
        *self.dispatcher.lock().await = Some(handle);
        info!("Private stream dispatcher started");
    }

    /// Subscribe `robot_id` to `symbol` on the credential's stream.
    ///
    /// Returns false when streaming is disabled or unavailable for the
    /// platform, or the connection could not be started; the robot then runs
    /// on polling alone.
    pub async fn acquire(&self, credential: &DecryptedCredential, symbol: &str, robot_id: i64) -> bool {
        let platform = credential.platform;
        if !self.config.stream_enabled_for(platform) {
            debug!("Private streaming disabled for {}", platform);
            return false;
        }

        let key = (platform, credential.id);
        let symbol = canonical_symbol(symbol);

        if self.subscriptions.read().await.contains_key(&key) {
            let mut subscriptions = self.subscriptions.write().await;
            if let Some(subscription) = subscriptions.get_mut(&key) {
                Self::attach(subscription, &symbol, robot_id).await;
                return true;
            }
        }

        let stream = match self.open_stream(credential, std::slice::from_ref(&symbol)).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return false,
            Err(e) => {
                warn!(
                    platform = %platform,
                    credential_id = credential.id,
                    "Private stream start failed, robot {} falls back to polling: {}",
                    robot_id,
                    e
                );
                return false;
            }
        };

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(existing) = subscriptions.get_mut(&key) {
            // Lost the race: keep the existing connection, discard ours
            Self::attach(existing, &symbol, robot_id).await;
            drop(subscriptions);
            stream.stop().await;
            debug!("Discarded duplicate stream for {} credential {}", platform, credential.id);
            return true;
        }

        let mut subscription = Subscription {
            stream,
            ref_count: 1,
            symbols: HashMap::new(),
            robots: HashMap::new(),
        };
        subscription.symbols.insert(symbol.clone(), 1);
        subscription.robots.insert((robot_id, symbol), 1);
        subscriptions.insert(key, subscription);

        info!(
            platform = %platform,
            credential_id = credential.id,
            "Private stream opened (robot {})",
            robot_id
        );
        true
    }

    /// Create, wire and start a connection already carrying `symbols`.
    /// `Ok(None)` when the platform has no stream implementation.
    async fn open_stream(
        &self,
        credential: &DecryptedCredential,
        symbols: &[String],
    ) -> Result<Option<Arc<dyn PrivateStream>>, StreamError> {
        let Some(stream) = self.factory.create(credential) else {
            return Ok(None);
        };
        stream.set_on_event(self.event_callback()).await;
        if let Some(proxy) = &credential.proxy {
            stream.set_proxy(Some(proxy.clone())).await;
        }
        for symbol in symbols {
            if let Err(e) = stream.add_symbol(symbol).await {
                warn!(
                    "Pre-start symbol add failed for {} {}: {}",
                    credential.platform, symbol, e
                );
            }
        }
        stream.start().await?;
        Ok(Some(stream))
    }

    /// Swap the credential's connection for one opened with fresh key material.
    ///
    /// Reference counts and symbols carry over. Returns false when nothing is
    /// subscribed for the credential or the new connection did not start, in
    /// which case the old one is left in place.
    pub async fn reconnect(&self, credential: &DecryptedCredential) -> bool {
        let key = (credential.platform, credential.id);
        let symbols: Vec<String> = match self.subscriptions.read().await.get(&key) {
            Some(subscription) => subscription.symbols.keys().cloned().collect(),
            None => return false,
        };

        let stream = match self.open_stream(credential, &symbols).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return false,
            Err(e) => {
                warn!(
                    platform = %credential.platform,
                    credential_id = credential.id,
                    "Reconnect failed, keeping the current stream: {}",
                    e
                );
                return false;
            }
        };

        let mut subscriptions = self.subscriptions.write().await;
        let Some(subscription) = subscriptions.get_mut(&key) else {
            drop(subscriptions);
            stream.stop().await;
            debug!("Last subscriber left during reconnect of credential {}", credential.id);
            return false;
        };

        // Symbols may have changed while the new connection was starting
        for symbol in subscription.symbols.keys() {
            if !symbols.contains(symbol) {
                if let Err(e) = stream.add_symbol(symbol).await {
                    warn!("Failed to add symbol {} to live stream: {}", symbol, e);
                }
            }
        }
        for symbol in &symbols {
            if !subscription.symbols.contains_key(symbol) {
                if let Err(e) = stream.remove_symbol(symbol).await {
                    warn!("Failed to remove symbol {} from live stream: {}", symbol, e);
                }
            }
        }
        let previous = std::mem::replace(&mut subscription.stream, stream);
        let ref_count = subscription.ref_count;
        drop(subscriptions);
        previous.stop().await;

        info!(
            platform = %credential.platform,
            credential_id = credential.id,
            "Private stream reconnected ({} subscribers)",
            ref_count
        );
        true
    }

    async fn attach(subscription: &mut Subscription, symbol: &str, robot_id: i64) {
        subscription.ref_count += 1;
        *subscription
            .robots
            .entry((robot_id, symbol.to_string()))
            .or_insert(0) += 1;

        let count = subscription.symbols.entry(symbol.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Err(e) = subscription.stream.add_symbol(symbol).await {
                warn!("Failed to add symbol {} to live stream: {}", symbol, e);
            }
        }
    }

    /// Undo one `acquire`. The connection stops when the last reference goes.
    pub async fn release(&self, platform: Platform, credential_id: i64, symbol: &str, robot_id: i64) {
        let key = (platform, credential_id);
        let symbol = canonical_symbol(symbol);

        let mut subscriptions = self.subscriptions.write().await;
        let Some(subscription) = subscriptions.get_mut(&key) else {
            return;
        };

        let robot_key = (robot_id, symbol.clone());
        match subscription.robots.get_mut(&robot_key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                subscription.robots.remove(&robot_key);
            }
            None => {
                debug!("Release for unknown robot {} on {} {}", robot_id, platform, symbol);
                return;
            }
        }

        if let Some(count) = subscription.symbols.get_mut(&symbol) {
            *count -= 1;
            if *count == 0 {
                subscription.symbols.remove(&symbol);
                if subscription.ref_count > 1 {
                    if let Err(e) = subscription.stream.remove_symbol(&symbol).await {
                        warn!("Failed to remove symbol {} from live stream: {}", symbol, e);
                    }
                }
            }
        }

        subscription.ref_count = subscription.ref_count.saturating_sub(1);
        if subscription.ref_count > 0 {
            return;
        }

        if let Some(subscription) = subscriptions.remove(&key) {
            drop(subscriptions);
            subscription.stream.stop().await;
            info!(
                platform = %platform,
                credential_id,
                "Private stream closed, last subscriber released"
            );
        }
    }

    fn event_callback(&self) -> EventCallback {
        let tx = self.queue_tx.clone();
        let received = self.received.clone();
        let dropped = self.dropped.clone();
        Arc::new(move |event: PrivateEvent| {
            received.fetch_add(1, Ordering::Relaxed);
            if tx.try_send(event).is_err() {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!("Private event queue full, {} events dropped so far", total);
                }
            }
        })
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<PrivateEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Private stream dispatcher stopped");
    }

    /// Route one event. Exposed for the dispatcher and for direct injection.
    pub async fn dispatch(&self, event: PrivateEvent) {
        let symbol = canonical_symbol(&event.symbol);
        let robot_ids = {
            let subscriptions = self.subscriptions.read().await;
            let Some(subscription) = subscriptions.get(&(event.platform, event.credential_id)) else {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                return;
            };
            if !symbol.is_empty() && !subscription.symbols.contains_key(&symbol) {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            subscription.robots_for(&symbol)
        };

        match event.kind {
            PrivateEventKind::Order => self.sink.apply_order_event(&event).await,
            PrivateEventKind::Position | PrivateEventKind::Account => {
                self.sink.apply_snapshot(&robot_ids, &event).await
            }
        }

        for robot_id in robot_ids {
            let sink = self.sink.clone();
            self.debouncer
                .schedule(robot_id, move || async move {
                    sink.trigger_reconcile(robot_id).await;
                })
                .await;
        }
    }

    pub async fn live_subscriptions(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn ref_count(&self, platform: Platform, credential_id: i64) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&(platform, credential_id))
            .map_or(0, |s| s.ref_count)
    }

    pub async fn stats(&self) -> StreamManagerStats {
        StreamManagerStats {
            live_subscriptions: self.live_subscriptions().await,
            events_received: self.received.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            events_filtered: self.filtered.load(Ordering::Relaxed),
        }
    }

    /// Stop every connection and the dispatcher
    pub async fn shutdown(&self) {
        let drained: Vec<(SubscriptionKey, Subscription)> =
            self.subscriptions.write().await.drain().collect();
        for ((platform, credential_id), subscription) in drained {
            subscription.stream.stop().await;
            debug!("Stopped stream for {} credential {}", platform, credential_id);
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Private stream dispatcher ended abnormally: {}", e);
            }
        }
        info!("Private stream manager shut down");
    }
}

//! Authenticated private WebSocket feed for OKX and Bitget.
//!
//! Both venues share the v5-style protocol: an HMAC login, `subscribe` /
//! `unsubscribe` ops with `args`, a text `ping` keepalive, and pushes shaped
//! as `{ "arg": { "channel": .. }, "data": [..] }`. Pushes are split per
//! instrument so each event carries exactly one symbol.

use crate::domain::entities::credential::{DecryptedCredential, ProxyConfig};
use crate::domain::entities::platform::{canonical_symbol, Platform};
use crate::domain::repositories::private_stream::{
    EventCallback, PrivateEvent, PrivateEventKind, PrivateStream, StreamError,
};
use crate::infrastructure::proxy_tunnel::{dial, WsStream};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const OKX_PRIVATE_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/private";
pub const BITGET_PRIVATE_WS_URL: &str = "wss://ws.bitget.com/v2/ws/private";

#[derive(Debug, Clone)]
pub struct WsStreamConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl WsStreamConfig {
    pub fn for_platform(platform: Platform) -> Option<Self> {
        let url = match platform {
            Platform::Okx => OKX_PRIVATE_WS_URL,
            Platform::Bitget => BITGET_PRIVATE_WS_URL,
            Platform::Binance | Platform::Gate => return None,
        };
        Some(Self {
            url: url.to_string(),
            ping_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        })
    }
}

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

/// Venue instrument id for a canonical symbol
pub fn venue_inst_id(platform: Platform, symbol: &str) -> String {
    let symbol = canonical_symbol(symbol);
    match platform {
        Platform::Okx => {
            for quote in ["USDT", "USDC", "USD"] {
                if let Some(base) = symbol.strip_suffix(quote) {
                    if !base.is_empty() {
                        return format!("{}-{}-SWAP", base, quote);
                    }
                }
            }
            symbol
        }
        _ => symbol,
    }
}

/// `base64(HMAC-SHA256(secret, timestamp + "GET" + "/users/self/verify"))`
pub fn login_signature(secret: &str, timestamp: &str) -> Result<String, StreamError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| StreamError::Auth(format!("HMAC error: {}", e)))?;
    mac.update(format!("{}GET/users/self/verify", timestamp).as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn order_arg(platform: Platform, symbol: &str) -> Value {
    let inst_id = venue_inst_id(platform, symbol);
    match platform {
        Platform::Bitget => json!({ "instType": "USDT-FUTURES", "channel": "orders", "instId": inst_id }),
        _ => json!({ "channel": "orders", "instType": "SWAP", "instId": inst_id }),
    }
}

fn account_args(platform: Platform) -> Vec<Value> {
    match platform {
        Platform::Bitget => vec![
            json!({ "instType": "USDT-FUTURES", "channel": "positions", "instId": "default" }),
            json!({ "instType": "USDT-FUTURES", "channel": "account", "coin": "default" }),
        ],
        _ => vec![
            json!({ "channel": "positions", "instType": "SWAP" }),
            json!({ "channel": "account" }),
        ],
    }
}

fn channel_kind(channel: &str) -> Option<PrivateEventKind> {
    match channel {
        "orders" => Some(PrivateEventKind::Order),
        "positions" => Some(PrivateEventKind::Position),
        "account" => Some(PrivateEventKind::Account),
        _ => None,
    }
}

/// Split one push into per-symbol events. Non-data frames yield nothing.
pub fn split_push(platform: Platform, credential_id: i64, text: &str) -> Vec<PrivateEvent> {
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };
    let Some(arg) = root.get("arg") else {
        return Vec::new();
    };
    let Some(kind) = arg
        .get("channel")
        .and_then(Value::as_str)
        .and_then(channel_kind)
    else {
        return Vec::new();
    };
    let Some(data) = root.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    let received_at = Utc::now();
    let event = |symbol: String, items: Vec<Value>| PrivateEvent {
        platform,
        credential_id,
        kind,
        symbol,
        payload: json!({ "arg": arg, "data": items }).to_string().into_bytes(),
        received_at,
    };

    if kind == PrivateEventKind::Account || data.is_empty() {
        return vec![event(String::new(), data.clone())];
    }

    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in data {
        let symbol = item
            .get("instId")
            .and_then(Value::as_str)
            .map(canonical_symbol)
            .unwrap_or_default();
        groups.entry(symbol).or_default().push(item.clone());
    }
    groups
        .into_iter()
        .map(|(symbol, items)| event(symbol, items))
        .collect()
}

struct StreamShared {
    platform: Platform,
    credential_id: i64,
    api_key: Zeroizing<String>,
    secret_key: Zeroizing<String>,
    passphrase: Zeroizing<String>,
    config: WsStreamConfig,
    symbols: RwLock<HashSet<String>>,
    on_event: RwLock<Option<EventCallback>>,
    proxy: RwLock<Option<ProxyConfig>>,
    running: AtomicBool,
}

pub struct WsPrivateStream {
    shared: Arc<StreamShared>,
    commands: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsPrivateStream {
    pub fn new(credential: &DecryptedCredential, config: WsStreamConfig) -> Self {
        let passphrase = credential
            .passphrase
            .clone()
            .unwrap_or_else(|| Zeroizing::new(String::new()));
        Self {
            shared: Arc::new(StreamShared {
                platform: credential.platform,
                credential_id: credential.id,
                api_key: credential.api_key.clone(),
                secret_key: credential.secret_key.clone(),
                passphrase,
                config,
                symbols: RwLock::new(HashSet::new()),
                on_event: RwLock::new(None),
                proxy: RwLock::new(credential.proxy.clone()),
                running: AtomicBool::new(false),
            }),
            commands: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    async fn send_command(&self, command: WsCommand) {
        if let Some(tx) = self.commands.lock().await.as_ref() {
            let _ = tx.send(command);
        }
    }
}

#[async_trait]
impl PrivateStream for WsPrivateStream {
    /// Connects and logs in once before returning, so a bad key or an
    /// unreachable venue is reported to the caller. Later drops reconnect in
    /// the background.
    async fn start(&self) -> Result<(), StreamError> {
        let mut task = self.task.lock().await;
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let ws = connect_and_login(&self.shared).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock().await = Some(tx);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        *task = Some(tokio::spawn(run_connection(shared, ws, rx)));

        info!(
            "Private stream started for {} credential {}",
            self.shared.platform, self.shared.credential_id
        );
        Ok(())
    }

    async fn stop(&self) {
        self.send_command(WsCommand::Shutdown).await;
        self.commands.lock().await.take();
        if let Some(handle) = self.task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(
                    "Private stream for credential {} did not stop in time",
                    self.shared.credential_id
                );
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
        info!(
            "Private stream stopped for {} credential {}",
            self.shared.platform, self.shared.credential_id
        );
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    async fn add_symbol(&self, symbol: &str) -> Result<(), StreamError> {
        let symbol = canonical_symbol(symbol);
        if self.shared.symbols.write().await.insert(symbol.clone()) {
            self.send_command(WsCommand::Subscribe(symbol)).await;
        }
        Ok(())
    }

    async fn remove_symbol(&self, symbol: &str) -> Result<(), StreamError> {
        let symbol = canonical_symbol(symbol);
        if self.shared.symbols.write().await.remove(&symbol) {
            self.send_command(WsCommand::Unsubscribe(symbol)).await;
        }
        Ok(())
    }

    async fn set_on_event(&self, callback: EventCallback) {
        *self.shared.on_event.write().await = Some(callback);
    }

    async fn set_proxy(&self, proxy: Option<ProxyConfig>) {
        *self.shared.proxy.write().await = proxy;
    }
}

async fn connect_and_login(shared: &StreamShared) -> Result<WsStream, StreamError> {
    let proxy = shared.proxy.read().await.clone();
    let mut ws = dial(&shared.config.url, proxy.as_ref(), shared.config.connect_timeout).await?;

    let timestamp = Utc::now().timestamp().to_string();
    let sign = login_signature(&shared.secret_key, &timestamp)?;
    let login = json!({
        "op": "login",
        "args": [{
            "apiKey": shared.api_key.as_str(),
            "passphrase": shared.passphrase.as_str(),
            "timestamp": timestamp,
            "sign": sign,
        }]
    });
    ws.send(Message::Text(login.to_string()))
        .await
        .map_err(|e| StreamError::Connect(e.to_string()))?;

    let wait_login = async {
        while let Some(message) = ws.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(_) => continue,
                Err(e) => return Err(StreamError::Connect(e.to_string())),
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            match value.get("event").and_then(Value::as_str) {
                Some("login") => {
                    let code = value.get("code").map(|c| match c {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                    return match code.as_deref() {
                        Some("0") | None => Ok(()),
                        Some(code) => Err(StreamError::Auth(format!(
                            "login rejected ({}): {}",
                            code,
                            value.get("msg").and_then(Value::as_str).unwrap_or("")
                        ))),
                    };
                }
                Some("error") => {
                    return Err(StreamError::Auth(
                        value
                            .get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("login error")
                            .to_string(),
                    ))
                }
                _ => continue,
            }
        }
        Err(StreamError::Closed)
    };

    tokio::time::timeout(shared.config.login_timeout, wait_login)
        .await
        .map_err(|_| StreamError::Auth("login timed out".to_string()))??;

    debug!(
        "Logged in to {} private stream for credential {}",
        shared.platform, shared.credential_id
    );
    Ok(ws)
}

async fn run_connection(
    shared: Arc<StreamShared>,
    first: WsStream,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
) {
    let mut current = Some(first);
    let mut backoff = shared.config.initial_backoff;

    loop {
        let ws = match current.take() {
            Some(ws) => ws,
            None => match connect_and_login(&shared).await {
                Ok(ws) => {
                    info!(
                        "Private stream reconnected for {} credential {}",
                        shared.platform, shared.credential_id
                    );
                    backoff = shared.config.initial_backoff;
                    ws
                }
                Err(e) => {
                    warn!(
                        "Private stream reconnect failed for credential {}: {} (retry in {:?})",
                        shared.credential_id, e, backoff
                    );
                    if wait_or_shutdown(&mut commands, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(shared.config.max_backoff);
                    continue;
                }
            },
        };

        match run_session(&shared, ws, &mut commands).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Disconnected(reason) => {
                warn!(
                    "Private stream for credential {} disconnected: {}",
                    shared.credential_id, reason
                );
                if wait_or_shutdown(&mut commands, backoff).await {
                    break;
                }
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
}

/// Sleep for `delay`, returning true if a shutdown arrives first. Symbol
/// commands received meanwhile are dropped: the symbol set is replayed on
/// reconnect.
async fn wait_or_shutdown(commands: &mut mpsc::UnboundedReceiver<WsCommand>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            command = commands.recv() => match command {
                Some(WsCommand::Shutdown) | None => return true,
                Some(_) => continue,
            },
        }
    }
}

async fn run_session(
    shared: &StreamShared,
    ws: WsStream,
    commands: &mut mpsc::UnboundedReceiver<WsCommand>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let mut args = account_args(shared.platform);
    for symbol in shared.symbols.read().await.iter() {
        args.push(order_arg(shared.platform, symbol));
    }
    let subscribe = json!({ "op": "subscribe", "args": args });
    if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
        return SessionEnd::Disconnected(format!("subscribe failed: {}", e));
    }

    let mut ping = tokio::time::interval(shared.config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => handle_text(shared, &text).await,
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return SessionEnd::Disconnected(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                None => return SessionEnd::Disconnected("stream ended".to_string()),
            },
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text("ping".to_string())).await {
                    return SessionEnd::Disconnected(format!("ping failed: {}", e));
                }
            }
            command = commands.recv() => match command {
                Some(WsCommand::Subscribe(symbol)) => {
                    let msg = json!({ "op": "subscribe", "args": [order_arg(shared.platform, &symbol)] });
                    if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                Some(WsCommand::Unsubscribe(symbol)) => {
                    let msg = json!({ "op": "unsubscribe", "args": [order_arg(shared.platform, &symbol)] });
                    if let Err(e) = write.send(Message::Text(msg.to_string())).await {
                        return SessionEnd::Disconnected(e.to_string());
                    }
                }
                Some(WsCommand::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

async fn handle_text(shared: &StreamShared, text: &str) {
    if text == "pong" {
        return;
    }

    let events = split_push(shared.platform, shared.credential_id, text);
    if events.is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            match value.get("event").and_then(Value::as_str) {
                Some("error") => error!(
                    "Private stream error for credential {}: {}",
                    shared.credential_id, text
                ),
                Some(event) => debug!("Private stream {} ack: {}", shared.platform, event),
                None => {}
            }
        }
        return;
    }

    let callback = shared.on_event.read().await.clone();
    if let Some(callback) = callback {
        for event in events {
            callback(event);
        }
    }
}

//! Authenticated streaming feed seam.
//!
//! A `PrivateStream` is one live connection for one (platform, credential)
//! pair. It decodes nothing beyond channel routing: events carry the raw
//! payload and are parsed by the consumers.

use crate::domain::entities::credential::{DecryptedCredential, ProxyConfig};
use crate::domain::entities::platform::Platform;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Stream connection failed: {0}")]
    Connect(String),

    #[error("Stream authentication failed: {0}")]
    Auth(String),

    #[error("Stream protocol error: {0}")]
    Protocol(String),

    #[error("Stream closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivateEventKind {
    Order,
    Position,
    Account,
}

#[derive(Debug, Clone)]
pub struct PrivateEvent {
    pub platform: Platform,
    pub credential_id: i64,
    pub kind: PrivateEventKind,
    /// Canonical symbol; empty for account-level events
    pub symbol: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Decode callback. Runs on the connection's receive loop and must not block.
pub type EventCallback = Arc<dyn Fn(PrivateEvent) + Send + Sync>;

#[async_trait]
pub trait PrivateStream: Send + Sync {
    async fn start(&self) -> Result<(), StreamError>;

    async fn stop(&self);

    fn is_running(&self) -> bool;

    async fn add_symbol(&self, symbol: &str) -> Result<(), StreamError>;

    async fn remove_symbol(&self, symbol: &str) -> Result<(), StreamError>;

    async fn set_on_event(&self, callback: EventCallback);

    /// Route the connection through an outbound proxy
    async fn set_proxy(&self, _proxy: Option<ProxyConfig>) {}
}

/// Builds streams per credential. `None` means the platform runs polling-only.
pub trait PrivateStreamFactory: Send + Sync {
    fn create(&self, credential: &DecryptedCredential) -> Option<Arc<dyn PrivateStream>>;
}

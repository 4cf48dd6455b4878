//! Exchange session cache.
//!
//! One client per credential id, shared by every robot on that credential.
//! Construction decrypts key material and resolves the proxy, so it only
//! happens on a miss; a cache hit never touches the network.

use crate::domain::errors::CredentialError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError};
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::exchange_client_factory::ExchangeClientFactory;
use crate::infrastructure::throttled_client::ThrottledExchangeClient;
use crate::rate_limit::create_rate_limiter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Client construction failed: {0}")]
    Construction(#[from] ExchangeError),
}

/// Outcome of a connectivity check; never an error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: u64,
}

pub struct ExchangeSessionManager {
    credentials: Arc<CredentialStore>,
    factory: ExchangeClientFactory,
    requests_per_second: u32,
    sessions: RwLock<HashMap<i64, Arc<dyn ExchangeClient>>>,
}

impl ExchangeSessionManager {
    pub fn new(
        credentials: Arc<CredentialStore>,
        factory: ExchangeClientFactory,
        requests_per_second: u32,
    ) -> Self {
        Self {
            credentials,
            factory,
            requests_per_second,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub async fn get(&self, credential_id: i64) -> Result<Arc<dyn ExchangeClient>, SessionError> {
        if let Some(client) = self.sessions.read().await.get(&credential_id) {
            return Ok(client.clone());
        }

        // Built without the lock; a racing miss that lands first wins
        let credential = self.credentials.load(credential_id).await?;
        let inner = self.factory.create(&credential)?;
        let built: Arc<dyn ExchangeClient> = Arc::new(ThrottledExchangeClient::new(
            inner,
            create_rate_limiter(self.requests_per_second),
        ));

        let mut sessions = self.sessions.write().await;
        if let Some(client) = sessions.get(&credential_id) {
            debug!("Session for credential {} built concurrently, reusing", credential_id);
            return Ok(client.clone());
        }
        sessions.insert(credential_id, built.clone());
        drop(sessions);

        info!(
            "Created exchange session for credential {} ({})",
            credential_id, credential.platform
        );
        Ok(built)
    }

    /// Drop the cached client; the next `get` rebuilds it
    pub async fn invalidate(&self, credential_id: i64) -> bool {
        let removed = self.sessions.write().await.remove(&credential_id).is_some();
        if removed {
            info!("Invalidated exchange session for credential {}", credential_id);
        }
        removed
    }

    pub async fn cached_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Build (or reuse) the session and fetch the balance once
    pub async fn test_session(&self, credential_id: i64) -> SessionTestResult {
        let started = Instant::now();
        let client = match self.get(credential_id).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Session test for credential {} failed: {}", credential_id, e);
                return SessionTestResult {
                    success: false,
                    message: e.to_string(),
                    latency_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let result = client.get_balance().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(balance) => {
                debug!(
                    "Session test for credential {} ok in {}ms",
                    credential_id, latency_ms
                );
                SessionTestResult {
                    success: true,
                    message: format!(
                        "connected, available {:.2} {}",
                        balance.available, balance.currency
                    ),
                    latency_ms,
                }
            }
            Err(e) => {
                warn!("Session test for credential {} failed: {}", credential_id, e);
                SessionTestResult {
                    success: false,
                    message: e.to_string(),
                    latency_ms,
                }
            }
        }
    }
}

//! Component wiring shared by the binary and the end-to-end tests.

use crate::application::event_router::EventRouter;
use crate::application::private_stream_manager::PrivateStreamManager;
use crate::application::reconciliation::ReconciliationService;
use crate::application::robot_engine::EngineRegistry;
use crate::application::robot_supervisor::{CredentialRefresh, RobotSupervisor, SupervisorError};
use crate::application::trade_fill_ledger::TradeFillLedger;
use crate::config::SyncConfig;
use crate::domain::errors::CredentialError;
use crate::domain::repositories::private_stream::PrivateStreamFactory;
use crate::infrastructure::credential_store::{CredentialCipher, CredentialStore};
use crate::infrastructure::exchange_client_factory::ExchangeClientFactory;
use crate::infrastructure::exchange_session_manager::ExchangeSessionManager;
use crate::persistence::credential_repository::CredentialRepository;
use crate::persistence::exchange_order_repository::ExchangeOrderRepository;
use crate::persistence::order_repository::OrderRepository;
use crate::persistence::robot_repository::RobotRepository;
use crate::persistence::trade_fill_repository::TradeFillRepository;
use crate::persistence::DbPool;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub pool: DbPool,
    pub config: SyncConfig,
    pub credentials: Arc<CredentialRepository>,
    pub robots: Arc<RobotRepository>,
    pub orders: Arc<OrderRepository>,
    pub sessions: Arc<ExchangeSessionManager>,
    pub engines: Arc<EngineRegistry>,
    pub fills: Arc<TradeFillLedger>,
    pub reconciliation: Arc<ReconciliationService>,
    pub streams: Arc<PrivateStreamManager>,
    pub supervisor: Arc<RobotSupervisor>,
}

impl AppContext {
    /// Build every component over one pool. Nothing is started.
    pub fn build(
        pool: DbPool,
        config: SyncConfig,
        cipher: Option<CredentialCipher>,
        clients: ExchangeClientFactory,
        stream_factory: Arc<dyn PrivateStreamFactory>,
    ) -> Self {
        let credentials = Arc::new(CredentialRepository::new(pool.clone()));
        let robots = Arc::new(RobotRepository::new(pool.clone()));
        let orders = Arc::new(OrderRepository::new(pool.clone()));

        let store = Arc::new(CredentialStore::new(
            credentials.clone(),
            cipher,
            config.global_proxy.clone(),
        ));
        let sessions = Arc::new(ExchangeSessionManager::new(
            store,
            clients,
            config.exchange_requests_per_second,
        ));

        let engines = Arc::new(EngineRegistry::new());
        let fills = Arc::new(TradeFillLedger::new(
            TradeFillRepository::new(pool.clone()),
            robots.clone(),
        ));
        let reconciliation = ReconciliationService::new(
            orders.clone(),
            ExchangeOrderRepository::new(pool.clone()),
            robots.clone(),
            fills.clone(),
            sessions.clone(),
            engines.clone(),
            config.clone(),
        );

        let router = Arc::new(EventRouter::new(reconciliation.clone(), engines.clone()));
        let streams = PrivateStreamManager::new(stream_factory, router, config.clone());

        let supervisor = RobotSupervisor::new(
            robots.clone(),
            sessions.clone(),
            engines.clone(),
            reconciliation.clone(),
            streams.clone(),
            config.clone(),
        );

        Self {
            pool,
            config,
            credentials,
            robots,
            orders,
            sessions,
            engines,
            fills,
            reconciliation,
            streams,
            supervisor,
        }
    }

    /// Store new key material for a credential and rebuild whatever still
    /// holds the old keys.
    pub async fn rotate_credential(
        &self,
        credential_id: i64,
        api_key: &str,
        secret_key: &str,
        passphrase: Option<&str>,
    ) -> Result<CredentialRefresh, SupervisorError> {
        let store = self.sessions.credentials();
        let passphrase = passphrase.map(|p| store.seal(p)).transpose()?;
        let rotated = self
            .credentials
            .rotate(
                credential_id,
                &store.seal(api_key)?,
                &store.seal(secret_key)?,
                passphrase.as_deref(),
            )
            .await?;
        if !rotated {
            return Err(CredentialError::NotFound(credential_id).into());
        }

        info!(credential_id, "Credential key material rotated");
        self.supervisor.refresh_credential(credential_id).await
    }
}

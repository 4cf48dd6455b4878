use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tradebot_sync::config::SyncConfig;
use tradebot_sync::context::AppContext;
use tradebot_sync::domain::entities::platform::Platform;
use tradebot_sync::infrastructure::credential_store::CredentialCipher;
use tradebot_sync::infrastructure::exchange_client_factory::ExchangeClientFactory;
use tradebot_sync::infrastructure::private_stream_factory::WsPrivateStreamFactory;
use tradebot_sync::persistence::{init_database_with, DatabaseConfig};
use tradebot_sync::secrets::{load_master_key, MasterKeyConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradebot_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env();
    let db_config = DatabaseConfig::from_env();
    info!("Opening ledger database at {}", db_config.url);
    let pool = init_database_with(&db_config).await?;

    let cipher = match load_master_key(&MasterKeyConfig::from_env()) {
        Ok(key) => Some(CredentialCipher::new(&key)),
        Err(e) => {
            warn!("No credential master key ({}); stored credentials are read as plaintext", e);
            None
        }
    };

    // Venue REST adapters are linked in by the deployment
    let clients = ExchangeClientFactory::new();
    if !Platform::ALL.iter().any(|p| clients.supports(*p)) {
        warn!("No exchange client builders registered; robots cannot trade until one is");
    }

    let context = AppContext::build(
        pool,
        config,
        cipher,
        clients,
        Arc::new(WsPrivateStreamFactory),
    );
    context.supervisor.start().await;
    info!("Tradebot sync running");

    shutdown_signal().await;

    context.supervisor.stop().await;
    context.pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

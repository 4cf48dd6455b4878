//! Exchange Client Factory
//!
//! Registry of per-platform client constructors. Venue REST adapters live
//! outside this crate; the binary (or a test) registers a builder for each
//! platform it can trade on.

use crate::domain::entities::credential::DecryptedCredential;
use crate::domain::entities::platform::Platform;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError, ExchangeResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builds a client from decrypted key material
pub type ClientBuilder =
    Arc<dyn Fn(&DecryptedCredential) -> ExchangeResult<Arc<dyn ExchangeClient>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ExchangeClientFactory {
    builders: HashMap<Platform, ClientBuilder>,
}

impl ExchangeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: Platform, builder: ClientBuilder) {
        info!("Registered exchange client builder for {}", platform);
        self.builders.insert(platform, builder);
    }

    pub fn with(mut self, platform: Platform, builder: ClientBuilder) -> Self {
        self.register(platform, builder);
        self
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.builders.contains_key(&platform)
    }

    pub fn create(&self, credential: &DecryptedCredential) -> ExchangeResult<Arc<dyn ExchangeClient>> {
        let builder = self.builders.get(&credential.platform).ok_or_else(|| {
            ExchangeError::Unsupported(format!(
                "no exchange client registered for {}",
                credential.platform
            ))
        })?;
        builder(credential)
    }
}

use crate::domain::entities::credential::DecryptedCredential;
use crate::domain::repositories::private_stream::{PrivateStream, PrivateStreamFactory};
use crate::infrastructure::ws_private_stream::{WsPrivateStream, WsStreamConfig};
use std::sync::Arc;
use tracing::debug;

/// WebSocket streams for venues with an adapter; the rest run polling-only
#[derive(Debug, Default, Clone, Copy)]
pub struct WsPrivateStreamFactory;

impl PrivateStreamFactory for WsPrivateStreamFactory {
    fn create(&self, credential: &DecryptedCredential) -> Option<Arc<dyn PrivateStream>> {
        match WsStreamConfig::for_platform(credential.platform) {
            Some(config) => Some(Arc::new(WsPrivateStream::new(credential, config))),
            None => {
                debug!("No private stream adapter for {}", credential.platform);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::platform::Platform;
    use zeroize::Zeroizing;

    fn credential(platform: Platform) -> DecryptedCredential {
        DecryptedCredential {
            id: 1,
            platform,
            api_key: Zeroizing::new("k".to_string()),
            secret_key: Zeroizing::new("s".to_string()),
            passphrase: None,
            proxy: None,
        }
    }

    #[test]
    fn test_adapters_by_platform() {
        let factory = WsPrivateStreamFactory;
        assert!(factory.create(&credential(Platform::Okx)).is_some());
        assert!(factory.create(&credential(Platform::Bitget)).is_some());
        assert!(factory.create(&credential(Platform::Binance)).is_none());
        assert!(factory.create(&credential(Platform::Gate)).is_none());
    }
}

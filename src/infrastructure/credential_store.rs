//! Credential decryption.
//!
//! Key material is stored either as plaintext or as `ENC:` + base64(nonce ||
//! ciphertext) under AES-256-GCM. Rows written before encryption was enabled
//! are still accepted: a value that fails to decrypt is used as stored.

use crate::domain::entities::credential::{Credential, DecryptedCredential, ProxyConfig};
use crate::domain::errors::CredentialError;
use crate::domain::repositories::credential_source::CredentialSource;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const ENCRYPTED_PREFIX: &str = "ENC:";
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed from the master secret
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// The key is zero-padded or truncated to 32 bytes.
    pub fn new(master_key: &str) -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        let raw = master_key.as_bytes();
        let len = raw.len().min(32);
        bytes[..len].copy_from_slice(&raw[..len]);
        let key = Key::<Aes256Gcm>::from_slice(bytes.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::Cipher(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            general_purpose::STANDARD.encode(blob)
        ))
    }

    /// Strict decryption; values without the prefix are returned unchanged
    pub fn decrypt(&self, value: &str) -> Result<Zeroizing<String>, CredentialError> {
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(Zeroizing::new(value.to_string()));
        };

        let blob = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::Cipher(format!("invalid base64: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(CredentialError::Cipher("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CredentialError::Cipher(format!("decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| CredentialError::Cipher(format!("invalid UTF-8: {}", e)))
    }

    /// Lenient decryption: failures fall back to the stored value
    pub fn decrypt_or_plain(&self, field: &str, value: &str) -> Zeroizing<String> {
        match self.decrypt(value) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("Could not decrypt credential {}, using stored value: {}", field, e);
                Zeroizing::new(value.to_string())
            }
        }
    }
}

/// Loads credentials and resolves their effective proxy
pub struct CredentialStore {
    source: Arc<dyn CredentialSource>,
    cipher: Option<CredentialCipher>,
    global_proxy: Option<ProxyConfig>,
}

impl CredentialStore {
    pub fn new(
        source: Arc<dyn CredentialSource>,
        cipher: Option<CredentialCipher>,
        global_proxy: Option<ProxyConfig>,
    ) -> Self {
        Self {
            source,
            cipher,
            global_proxy,
        }
    }

    pub async fn load(&self, credential_id: i64) -> Result<DecryptedCredential, CredentialError> {
        let credential = self
            .source
            .load_credential(credential_id)
            .await?
            .ok_or(CredentialError::NotFound(credential_id))?;
        Ok(self.decrypt(credential))
    }

    /// Form a secret is stored in: encrypted when a master key is loaded
    pub fn seal(&self, value: &str) -> Result<String, CredentialError> {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(value),
            None => Ok(value.to_string()),
        }
    }

    fn decrypt(&self, credential: Credential) -> DecryptedCredential {
        let open = |field: &str, value: &str| -> Zeroizing<String> {
            match &self.cipher {
                Some(cipher) => cipher.decrypt_or_plain(field, value),
                None => {
                    if CredentialCipher::is_encrypted(value) {
                        warn!(
                            "Credential {} {} is encrypted but no master key is loaded",
                            credential.id, field
                        );
                    }
                    Zeroizing::new(value.to_string())
                }
            }
        };

        let api_key = open("api_key", &credential.api_key);
        let secret_key = open("secret_key", &credential.secret_key);
        let passphrase = credential
            .passphrase
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| open("passphrase", p));

        let proxy = credential.proxy.clone().or_else(|| self.global_proxy.clone());
        if let Some(proxy) = &proxy {
            debug!(
                "Credential {} uses proxy {}:{}",
                credential.id, proxy.host, proxy.port
            );
        }

        DecryptedCredential {
            id: credential.id,
            platform: credential.platform,
            api_key,
            secret_key,
            passphrase,
            proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::credential::ProxyKind;
    use crate::domain::entities::platform::Platform;
    use async_trait::async_trait;

    struct StaticSource(Credential);

    #[async_trait]
    impl CredentialSource for StaticSource {
        async fn load_credential(&self, id: i64) -> Result<Option<Credential>, CredentialError> {
            Ok((id == self.0.id).then(|| self.0.clone()))
        }
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = CredentialCipher::new("a-master-key-of-some-length");
        let encrypted = cipher.encrypt("my-api-secret").unwrap();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert_eq!(cipher.decrypt(&encrypted).unwrap().as_str(), "my-api-secret");
        assert_eq!(cipher.decrypt("plain").unwrap().as_str(), "plain");
    }

    #[test]
    fn test_wrong_key_falls_back_to_stored_value() {
        let encrypted = CredentialCipher::new("key-one-key-one-key-one")
            .encrypt("secret")
            .unwrap();
        let other = CredentialCipher::new("key-two-key-two-key-two");
        assert!(other.decrypt(&encrypted).is_err());
        assert_eq!(other.decrypt_or_plain("secret_key", &encrypted).as_str(), encrypted);
    }

    #[test]
    fn test_long_key_truncated() {
        let long = "k".repeat(64);
        let a = CredentialCipher::new(&long);
        let b = CredentialCipher::new(&long[..32]);
        let encrypted = a.encrypt("x").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap().as_str(), "x");
    }

    #[tokio::test]
    async fn test_store_resolves_proxy_and_decrypts() {
        let cipher = CredentialCipher::new("store-master-key-123456");
        let credential = Credential {
            id: 5,
            platform: Platform::Bitget,
            api_key: cipher.encrypt("api").unwrap(),
            secret_key: "legacy-plain-secret".to_string(),
            passphrase: Some(String::new()),
            proxy: None,
        };
        let global = ProxyConfig::from_host_port(ProxyKind::Http, "127.0.0.1:7890").unwrap();
        let store = CredentialStore::new(
            Arc::new(StaticSource(credential)),
            Some(cipher),
            Some(global.clone()),
        );

        let decrypted = store.load(5).await.unwrap();
        assert_eq!(decrypted.api_key.as_str(), "api");
        assert_eq!(decrypted.secret_key.as_str(), "legacy-plain-secret");
        assert!(decrypted.passphrase.is_none());
        assert_eq!(decrypted.proxy, Some(global));

        assert!(matches!(store.load(6).await, Err(CredentialError::NotFound(6))));
    }

    #[tokio::test]
    async fn test_seal_round_trips_through_load() {
        let credential = |secret: String| Credential {
            id: 1,
            platform: Platform::Okx,
            api_key: "api".to_string(),
            secret_key: secret,
            passphrase: None,
            proxy: None,
        };

        let store = CredentialStore::new(
            Arc::new(StaticSource(credential(String::new()))),
            Some(CredentialCipher::new("seal-master-key-123456")),
            None,
        );
        let sealed = store.seal("rotated-secret").unwrap();
        assert!(CredentialCipher::is_encrypted(&sealed));

        let reloaded = CredentialStore::new(
            Arc::new(StaticSource(credential(sealed))),
            Some(CredentialCipher::new("seal-master-key-123456")),
            None,
        );
        assert_eq!(reloaded.load(1).await.unwrap().secret_key.as_str(), "rotated-secret");

        let plain = CredentialStore::new(Arc::new(StaticSource(credential(String::new()))), None, None);
        assert_eq!(plain.seal("rotated-secret").unwrap(), "rotated-secret");
    }
}

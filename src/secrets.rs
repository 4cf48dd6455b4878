//! Credential master key loading.
//!
//! The key comes from a 1Password reference when one is configured and the
//! `op` CLI can resolve it. The plain environment variable is accepted only
//! in debug builds or with `ALLOW_ENV_SECRETS=true`. The key never leaves a
//! `Zeroizing` buffer.

use std::env;
use std::process::Command;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const MASTER_KEY_OP_REF_VAR: &str = "CREDENTIAL_KEY_OP_REF";
pub const MASTER_KEY_ENV_VAR: &str = "CREDENTIAL_ENCRYPTION_KEY";

const MIN_KEY_LENGTH: usize = 16;
const PLACEHOLDER_KEYS: [&str; 3] = ["changeme", "placeholder", "12345"];

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No master key source available: {0}")]
    Unavailable(String),

    #[error("1Password CLI error: {0}")]
    OnePassword(String),

    #[error("Master key rejected: {0}")]
    Rejected(String),
}

/// Where the master key may be read from
#[derive(Debug, Clone)]
pub struct MasterKeyConfig {
    /// `op://` reference; empty skips the CLI
    pub op_reference: String,
    pub env_var: String,
    pub allow_env: bool,
    /// Fail instead of falling back when the reference cannot be resolved
    pub require_op: bool,
}

impl Default for MasterKeyConfig {
    fn default() -> Self {
        Self {
            op_reference: String::new(),
            env_var: MASTER_KEY_ENV_VAR.to_string(),
            allow_env: cfg!(debug_assertions),
            require_op: false,
        }
    }
}

impl MasterKeyConfig {
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            env::var(name)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .ok()
        };
        let defaults = Self::default();
        Self {
            op_reference: env::var(MASTER_KEY_OP_REF_VAR).unwrap_or_default(),
            allow_env: flag("ALLOW_ENV_SECRETS").unwrap_or(defaults.allow_env),
            require_op: flag("REQUIRE_OP_SECRETS").unwrap_or(defaults.require_op),
            ..defaults
        }
    }
}

/// Resolve and check the credential master key
pub fn load_master_key(config: &MasterKeyConfig) -> Result<Zeroizing<String>, SecretError> {
    let key = resolve(config)?;
    check_master_key(&key)?;
    Ok(key)
}

fn resolve(config: &MasterKeyConfig) -> Result<Zeroizing<String>, SecretError> {
    let reference = config.op_reference.trim();
    if !reference.is_empty() {
        match read_op_reference(reference) {
            Ok(key) => {
                info!("Master key loaded from 1Password");
                return Ok(key);
            }
            Err(e) if config.require_op => return Err(e),
            Err(e) => warn!("1Password lookup failed, trying environment: {}", e),
        }
    } else if config.require_op {
        return Err(SecretError::Unavailable(format!(
            "{} is not set",
            MASTER_KEY_OP_REF_VAR
        )));
    }

    if !config.allow_env {
        return Err(SecretError::Unavailable(format!(
            "{} is disabled outside debug builds (set ALLOW_ENV_SECRETS=true)",
            config.env_var
        )));
    }
    let key = env::var(&config.env_var)
        .map_err(|_| SecretError::Unavailable(format!("{} is not set", config.env_var)))?;
    warn!("Master key loaded from {}; prefer a 1Password reference", config.env_var);
    Ok(Zeroizing::new(key))
}

fn read_op_reference(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    let output = Command::new("op")
        .args(["read", reference])
        .output()
        .map_err(|e| SecretError::OnePassword(format!("cannot run op: {}", e)))?;
    if !output.status.success() {
        return Err(SecretError::OnePassword(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let raw = Zeroizing::new(output.stdout);
    let key = std::str::from_utf8(&raw)
        .map_err(|e| SecretError::OnePassword(format!("non UTF-8 output: {}", e)))?
        .trim();
    if key.is_empty() {
        return Err(SecretError::OnePassword("empty secret".to_string()));
    }
    Ok(Zeroizing::new(key.to_string()))
}

/// Reject keys too short or obviously left at a placeholder value
pub fn check_master_key(key: &str) -> Result<(), SecretError> {
    if key.len() < MIN_KEY_LENGTH {
        return Err(SecretError::Rejected(format!(
            "{} characters, at least {} required",
            key.len(),
            MIN_KEY_LENGTH
        )));
    }
    let lower = key.to_lowercase();
    if let Some(pattern) = PLACEHOLDER_KEYS.iter().find(|p| lower.contains(*p)) {
        return Err(SecretError::Rejected(format!("contains '{}'", pattern)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_config(var: &str, allow_env: bool) -> MasterKeyConfig {
        MasterKeyConfig {
            op_reference: String::new(),
            env_var: var.to_string(),
            allow_env,
            require_op: false,
        }
    }

    #[test]
    fn test_check_master_key() {
        assert!(check_master_key("short").is_err());
        assert!(check_master_key("changeme-changeme-changeme").is_err());
        assert!(check_master_key(&"k".repeat(32)).is_ok());
    }

    #[test]
    fn test_env_key_requires_opt_in() {
        env::set_var("TRADEBOT_TEST_MASTER_KEY", "abcdefghijklmnopqrstuvwxyz");

        let key = load_master_key(&env_config("TRADEBOT_TEST_MASTER_KEY", true)).unwrap();
        assert_eq!(key.as_str(), "abcdefghijklmnopqrstuvwxyz");

        assert!(matches!(
            load_master_key(&env_config("TRADEBOT_TEST_MASTER_KEY", false)),
            Err(SecretError::Unavailable(_))
        ));
        env::remove_var("TRADEBOT_TEST_MASTER_KEY");
    }

    #[test]
    fn test_missing_env_key() {
        assert!(load_master_key(&env_config("TRADEBOT_NONEXISTENT_KEY", true)).is_err());
    }

    #[test]
    fn test_required_reference_without_one_fails() {
        let config = MasterKeyConfig {
            require_op: true,
            ..env_config("TRADEBOT_NONEXISTENT_KEY", true)
        };
        assert!(matches!(load_master_key(&config), Err(SecretError::Unavailable(_))));
    }
}

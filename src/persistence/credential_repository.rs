//! Stored API credentials. Key fields are persisted as given (plain or `ENC:`).

use super::models::{CredentialRecord, NewCredential};
use super::{write_error, DatabaseError, DbPool};
use crate::domain::entities::credential::Credential;
use crate::domain::errors::CredentialError;
use crate::domain::repositories::credential_source::CredentialSource;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

pub struct CredentialRepository {
    pool: DbPool,
}

impl CredentialRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, credential: &NewCredential) -> Result<i64, DatabaseError> {
        let proxy = credential.proxy.as_ref();
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO credentials (
                platform, api_key, secret_key, passphrase, proxy_type, proxy_host, proxy_port,
                proxy_username, proxy_password
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            "#,
        )
        .bind(credential.platform.name())
        .bind(&credential.api_key)
        .bind(&credential.secret_key)
        .bind(&credential.passphrase)
        .bind(proxy.map(|p| p.kind.scheme()))
        .bind(proxy.map(|p| p.host.clone()))
        .bind(proxy.map(|p| i64::from(p.port)))
        .bind(proxy.and_then(|p| p.username.clone()))
        .bind(proxy.and_then(|p| p.password.clone()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error("Failed to insert credential", e))?;

        info!("Stored credential {} for {}", id, credential.platform);
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Credential>, DatabaseError> {
        let record = sqlx::query_as::<_, CredentialRecord>(
            r#"
            SELECT id, platform, api_key, secret_key, passphrase, proxy_type, proxy_host,
                   proxy_port, proxy_username, proxy_password
            FROM credentials WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load credential {}: {}", id, e);
            DatabaseError::QueryError(format!("Failed to load credential: {}", e))
        })?;

        match record {
            Some(record) => Ok(Some(record.into_credential()?)),
            None => Ok(None),
        }
    }

    /// Replace key material in place; returns false when the credential does not exist
    pub async fn rotate(
        &self,
        id: i64,
        api_key: &str,
        secret_key: &str,
        passphrase: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let rows = sqlx::query(
            "UPDATE credentials SET api_key = ?1, secret_key = ?2, passphrase = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(api_key)
        .bind(secret_key)
        .bind(passphrase)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("Failed to rotate credential", e))?
        .rows_affected();
        Ok(rows > 0)
    }
}

#[async_trait]
impl CredentialSource for CredentialRepository {
    async fn load_credential(&self, id: i64) -> Result<Option<Credential>, CredentialError> {
        self.get(id).await.map_err(|e| match e {
            DatabaseError::InvalidData(invalid) => CredentialError::Invalid(invalid),
            other => CredentialError::Storage(other.to_string()),
        })
    }
}

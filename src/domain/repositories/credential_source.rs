use crate::domain::entities::credential::Credential;
use crate::domain::errors::CredentialError;
use async_trait::async_trait;

/// Read access to stored (possibly encrypted) credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load_credential(&self, id: i64) -> Result<Option<Credential>, CredentialError>;
}

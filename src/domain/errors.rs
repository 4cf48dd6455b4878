use thiserror::Error;

/// Invalid domain input: unknown vocabulary or an incomplete risk profile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Invalid order side: {0}")]
    InvalidOrderSide(String),

    #[error("Invalid position side: {0}")]
    InvalidPositionSide(String),

    #[error("Unknown ledger status: {0}")]
    UnknownLedgerStatus(String),

    #[error("Unknown robot status code: {0}")]
    UnknownRobotStatus(i64),

    #[error("Unknown market state: {0}")]
    UnknownMarketState(String),

    #[error("Risk profile has no parameters for market state '{0}'")]
    MissingMarketState(String),

    #[error("Invalid risk parameter {field} for market state '{state}': {value}")]
    InvalidRiskParameter {
        state: String,
        field: &'static str,
        value: f64,
    },

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),
}

/// Errors raised while loading or decrypting credentials
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(i64),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Credential cipher error: {0}")]
    Cipher(String),

    #[error("Invalid credential data: {0}")]
    Invalid(#[from] ValidationError),
}

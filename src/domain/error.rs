//! Error types for the ledger anchoring service.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Duplicate source: {source_module}/{source_id} is already anchored")]
    DuplicateSource {
        source_module: String,
        source_id: String,
    },

    #[error("Hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure is transient and the operation may be attempted again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Blockchain(e) => e.is_retryable(),
            Self::Database(DatabaseError::Connection(_)) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Input validation failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("{0}")]
    Multiple(String),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ValidationError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::Multiple(e.to_string())
    }
}

/// Tenant and process configuration failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No ledger configuration for organization {0}")]
    Missing(String),

    #[error("Ledger is disabled for organization {0}")]
    Inactive(String),

    #[error("Unsupported blockchain network: {0}")]
    UnsupportedNetwork(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Duplicate(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(e.to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

/// Chain interaction failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    /// Endpoint unreachable or connection dropped
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Malformed or error JSON-RPC response
    #[error("RPC error: {0}")]
    RpcError(String),

    /// The chain rejected or reverted the transaction
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Insufficient gas: {0}")]
    InsufficientGas(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),
}

impl BlockchainError {
    /// Connectivity problems are transient; rejections by the chain are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockchain_error_retryable_classification() {
        assert!(BlockchainError::Connection("refused".into()).is_retryable());
        assert!(BlockchainError::Timeout("30s".into()).is_retryable());
        assert!(!BlockchainError::TransactionFailed("reverted".into()).is_retryable());
        assert!(!BlockchainError::InsufficientGas("out of gas".into()).is_retryable());
        assert!(!BlockchainError::RpcError("bad json".into()).is_retryable());
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::DuplicateSource {
            source_module: "finance".into(),
            source_id: "INV-001".into(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate source: finance/INV-001 is already anchored"
        );

        let err: AppError = ValidationError::MissingField("organization_id".into()).into();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(!err.is_retryable());
    }
}

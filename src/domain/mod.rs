//! Domain layer containing core business types, hashing, traits, and error definitions.

pub mod error;
pub mod hash;
pub mod traits;
pub mod types;

pub use error::{AppError, BlockchainError, ConfigError, DatabaseError, ValidationError};
pub use traits::{ChainClient, LedgerStore};
pub use types::{
    AnchorPayload, AuditPage, AuditQuery, BatchPayload, BatchStatus, BlockchainNetwork,
    ChainEvent, ChainSubmission, ChainTxStatus, ConfirmationDetails, HealthResponse, HealthStatus,
    LedgerBatch, LedgerConfiguration, LedgerEvent, LedgerEventType, LedgerTransaction,
    NewLedgerTransaction, TransactionDetails, TransactionStats, TransactionStatus,
    VerificationResult,
};

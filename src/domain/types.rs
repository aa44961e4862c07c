//! Domain types with validation support.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use super::error::{AppError, ValidationError};
use super::hash;

/// Fields every anchored `transaction_data` object must carry
pub const REQUIRED_DATA_FIELDS: &[&str] = &["amount", "currency", "description"];

/// Default number of submission attempts per transaction
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Lifecycle status of a ledger transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, not yet sent to the chain
    #[default]
    Pending,
    /// Claimed by exactly one submitter, chain call in flight
    Submitting,
    /// Accepted by the chain, awaiting confirmation
    Submitted,
    /// Included and finalized on chain
    Confirmed,
    /// Submission or confirmation failed
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitting" => Ok(Self::Submitting),
            "submitted" => Ok(Self::Submitted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of audit event appended to the ledger event log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    TransactionLogged,
    TransactionSubmitted,
    TransactionConfirmed,
    TransactionFailed,
    HashVerified,
    RetryAttempted,
    BatchProcessed,
    ErrorOccurred,
}

impl LedgerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionLogged => "transaction_logged",
            Self::TransactionSubmitted => "transaction_submitted",
            Self::TransactionConfirmed => "transaction_confirmed",
            Self::TransactionFailed => "transaction_failed",
            Self::HashVerified => "hash_verified",
            Self::RetryAttempted => "retry_attempted",
            Self::BatchProcessed => "batch_processed",
            Self::ErrorOccurred => "error_occurred",
        }
    }
}

impl std::str::FromStr for LedgerEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction_logged" => Ok(Self::TransactionLogged),
            "transaction_submitted" => Ok(Self::TransactionSubmitted),
            "transaction_confirmed" => Ok(Self::TransactionConfirmed),
            "transaction_failed" => Ok(Self::TransactionFailed),
            "hash_verified" => Ok(Self::HashVerified),
            "retry_attempted" => Ok(Self::RetryAttempted),
            "batch_processed" => Ok(Self::BatchProcessed),
            "error_occurred" => Ok(Self::ErrorOccurred),
            _ => Err(format!("Invalid ledger event type: {}", s)),
        }
    }
}

/// Chain family a tenant anchors to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockchainNetwork {
    /// Ethereum-compatible chain reached over HTTP JSON-RPC
    Evm,
    /// Substrate chain with the ledger pallet, reached over WebSocket JSON-RPC
    #[default]
    Substrate,
}

impl BlockchainNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Substrate => "substrate",
        }
    }

    /// Endpoint used when a configuration leaves `rpc_endpoint` empty
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            Self::Evm => "http://localhost:8545",
            Self::Substrate => "ws://localhost:9944",
        }
    }
}

impl std::str::FromStr for BlockchainNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "evm" | "ethereum" | "polygon" | "bsc" => Ok(Self::Evm),
            "substrate" | "polkadot" => Ok(Self::Substrate),
            _ => Err(format!("Unsupported blockchain network: {}", s)),
        }
    }
}

impl std::fmt::Display for BlockchainNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A business event handed over by a producer module
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewLedgerTransaction {
    #[validate(length(min = 1, max = 50, message = "Transaction type is required"))]
    pub transaction_type: String,
    #[validate(length(min = 1, max = 50, message = "Source module is required"))]
    pub source_module: String,
    #[validate(length(min = 1, max = 100, message = "Source id is required"))]
    pub source_id: String,
    pub transaction_data: Value,
    pub organization_id: Option<String>,
    pub created_by_id: Option<String>,
}

impl NewLedgerTransaction {
    #[must_use]
    pub fn new(
        transaction_type: impl Into<String>,
        source_module: impl Into<String>,
        source_id: impl Into<String>,
        transaction_data: Value,
        organization_id: Option<String>,
    ) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            source_module: source_module.into(),
            source_id: source_id.into(),
            transaction_data,
            organization_id,
            created_by_id: None,
        }
    }

    #[must_use]
    pub fn created_by(mut self, user_id: impl Into<String>) -> Self {
        self.created_by_id = Some(user_id.into());
        self
    }

    /// Full producer-side validation. Returns the organization id on success.
    pub fn check(&self) -> Result<&str, ValidationError> {
        self.validate()?;

        let organization_id = self
            .organization_id
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingField("organization_id".to_string()))?;

        validate_transaction_data(&self.transaction_data)?;
        Ok(organization_id)
    }
}

/// `transaction_data` must be a non-empty object carrying the required fields.
pub fn validate_transaction_data(data: &Value) -> Result<(), ValidationError> {
    let object = data.as_object().ok_or_else(|| {
        ValidationError::invalid("transaction_data", "Transaction data must be an object")
    })?;
    if object.is_empty() {
        return Err(ValidationError::MissingField(
            "transaction_data".to_string(),
        ));
    }
    for field in REQUIRED_DATA_FIELDS {
        if !object.contains_key(*field) {
            return Err(ValidationError::invalid(
                "transaction_data",
                format!("Transaction data must contain '{}' field", field),
            ));
        }
    }
    Ok(())
}

/// Optional chain facts recorded on confirmation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationDetails {
    pub block_number: Option<i64>,
    pub transaction_index: Option<i32>,
    pub gas_used: Option<i64>,
    pub gas_price: Option<i64>,
}

/// Core anchored transaction entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub transaction_type: String,
    pub source_module: String,
    pub source_id: String,
    pub transaction_data: Value,
    /// SHA-256 over the identifying fields and canonical data
    pub hash: String,
    pub status: TransactionStatus,
    /// Chain-side transaction hash once submitted
    pub blockchain_hash: Option<String>,
    pub block_number: Option<i64>,
    pub transaction_index: Option<i32>,
    pub gas_used: Option<i64>,
    pub gas_price: Option<i64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    /// Earliest time the retry worker may resubmit a failed record
    pub next_retry_at: Option<DateTime<Utc>>,
    pub organization_id: String,
    pub created_by_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Build a pending record from a validated producer event and its precomputed hash.
    #[must_use]
    pub fn from_new(
        new: &NewLedgerTransaction,
        organization_id: &str,
        hash: String,
        max_retries: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transaction_type: new.transaction_type.clone(),
            source_module: new.source_module.clone(),
            source_id: new.source_id.clone(),
            transaction_data: new.transaction_data.clone(),
            hash,
            status: TransactionStatus::Pending,
            blockchain_hash: None,
            block_number: None,
            transaction_index: None,
            gas_used: None,
            gas_price: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            next_retry_at: None,
            organization_id: organization_id.to_string(),
            created_by_id: new.created_by_id.clone(),
            created_at: now,
            submitted_at: None,
            confirmed_at: None,
            failed_at: None,
            updated_at: now,
        }
    }

    /// Hash of the record's current contents
    pub fn compute_hash(&self) -> Result<String, AppError> {
        hash::transaction_hash(
            &self.transaction_type,
            &self.source_module,
            &self.source_id,
            &self.transaction_data,
            &self.organization_id,
        )
    }

    /// `false` means the record changed after its hash was taken.
    pub fn verify_hash(&self) -> Result<bool, AppError> {
        Ok(self.compute_hash()?.eq_ignore_ascii_case(&self.hash))
    }

    /// Record chain acceptance. Returns `false` when nothing changed: a repeat with the
    /// same chain id, or a record that is already confirmed.
    pub fn mark_submitted(&mut self, chain_tx_id: &str) -> bool {
        if self.status == TransactionStatus::Confirmed {
            return false;
        }
        if self.status == TransactionStatus::Submitted
            && self.blockchain_hash.as_deref() == Some(chain_tx_id)
        {
            return false;
        }
        let now = Utc::now();
        self.status = TransactionStatus::Submitted;
        self.blockchain_hash = Some(chain_tx_id.to_string());
        self.submitted_at = Some(now);
        self.error_message = None;
        self.next_retry_at = None;
        self.updated_at = now;
        true
    }

    pub fn mark_confirmed(&mut self, details: ConfirmationDetails) {
        let now = Utc::now();
        self.status = TransactionStatus::Confirmed;
        self.block_number = details.block_number.or(self.block_number);
        self.transaction_index = details.transaction_index.or(self.transaction_index);
        self.gas_used = details.gas_used.or(self.gas_used);
        self.gas_price = details.gas_price.or(self.gas_price);
        self.confirmed_at = Some(now);
        self.updated_at = now;
    }

    /// Every failure consumes one retry.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        let now = Utc::now();
        self.status = TransactionStatus::Failed;
        self.error_message = Some(error_message.into());
        self.failed_at = Some(now);
        self.retry_count += 1;
        self.updated_at = now;
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.status == TransactionStatus::Failed && self.retry_count < self.max_retries
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Pending | TransactionStatus::Submitting | TransactionStatus::Submitted
        )
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == TransactionStatus::Confirmed
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == TransactionStatus::Failed
    }

    /// Payload written on chain for this record
    #[must_use]
    pub fn anchor_payload(&self) -> AnchorPayload {
        AnchorPayload {
            transaction_type: self.transaction_type.clone(),
            source_module: self.source_module.clone(),
            source_id: self.source_id.clone(),
            transaction_hash: self.hash.clone(),
            organization_id: self.organization_id.clone(),
            transaction_data: self.transaction_data.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Group of transactions anchored with a single chain call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerBatch {
    pub id: Uuid,
    /// Merkle root over the ordered member hashes
    pub batch_hash: String,
    /// Members in the order their hashes were committed
    pub transaction_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub blockchain_hash: Option<String>,
    pub block_number: Option<i64>,
    pub gas_used: Option<i64>,
    pub error_message: Option<String>,
    pub organization_id: String,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl LedgerBatch {
    #[must_use]
    pub fn new(organization_id: &str, transaction_ids: Vec<Uuid>, batch_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_hash,
            transaction_ids,
            status: BatchStatus::Pending,
            blockchain_hash: None,
            block_number: None,
            gas_used: None,
            error_message: None,
            organization_id: organization_id.to_string(),
            created_at: Utc::now(),
            submitted_at: None,
            confirmed_at: None,
            failed_at: None,
        }
    }

    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.transaction_ids.len()
    }

    pub fn mark_submitted(&mut self, chain_tx_id: &str) {
        self.status = BatchStatus::Submitted;
        self.blockchain_hash = Some(chain_tx_id.to_string());
        self.submitted_at = Some(Utc::now());
        self.error_message = None;
    }

    pub fn mark_confirmed(&mut self, block_number: Option<i64>, gas_used: Option<i64>) {
        self.status = BatchStatus::Confirmed;
        self.block_number = block_number.or(self.block_number);
        self.gas_used = gas_used.or(self.gas_used);
        self.confirmed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.status = BatchStatus::Failed;
        self.error_message = Some(error_message.into());
        self.failed_at = Some(Utc::now());
    }
}

/// Append-only audit row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub event_type: LedgerEventType,
    pub event_data: Value,
    pub blockchain_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEvent {
    #[must_use]
    pub fn new(transaction_id: Uuid, event_type: LedgerEventType, event_data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            event_type,
            event_data,
            blockchain_event_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-organization chain connection and anchoring policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct LedgerConfiguration {
    #[validate(length(min = 1, message = "Organization id is required"))]
    pub organization_id: String,
    pub blockchain_network: BlockchainNetwork,
    #[validate(url(message = "RPC endpoint must be a valid URL"))]
    pub rpc_endpoint: String,
    pub contract_address: Option<String>,
    /// Node-managed account used as `from` for EVM submissions
    pub sender_address: Option<String>,
    #[validate(range(min = 1, message = "Batch size must be greater than 0"))]
    pub batch_size: i32,
    #[validate(range(min = 1, message = "Batch timeout must be greater than 0"))]
    pub batch_timeout_seconds: i64,
    #[validate(range(min = 1, message = "Retry attempts must be greater than 0"))]
    pub retry_attempts: i32,
    #[validate(range(min = 0, message = "Gas limit must not be negative"))]
    pub gas_limit: i64,
    pub gas_price: Option<i64>,
    pub auto_confirm: bool,
    pub is_active: bool,
}

impl LedgerConfiguration {
    /// Configuration with the stock policy defaults
    #[must_use]
    pub fn new(organization_id: impl Into<String>, network: BlockchainNetwork) -> Self {
        Self {
            organization_id: organization_id.into(),
            blockchain_network: network,
            rpc_endpoint: network.default_endpoint().to_string(),
            contract_address: None,
            sender_address: None,
            batch_size: 10,
            batch_timeout_seconds: 300,
            retry_attempts: DEFAULT_MAX_RETRIES,
            gas_limit: 1_000_000,
            gas_price: None,
            auto_confirm: true,
            is_active: true,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, rpc_endpoint: impl Into<String>) -> Self {
        self.rpc_endpoint = rpc_endpoint.into();
        self
    }

    #[must_use]
    pub fn with_contract(mut self, contract_address: impl Into<String>) -> Self {
        self.contract_address = Some(contract_address.into());
        self
    }

    /// Validation that runs before any configuration is persisted or used
    pub fn check(&self) -> Result<(), ValidationError> {
        self.validate()?;
        let scheme_ok = match self.blockchain_network {
            BlockchainNetwork::Evm => {
                self.rpc_endpoint.starts_with("http://") || self.rpc_endpoint.starts_with("https://")
            }
            BlockchainNetwork::Substrate => {
                self.rpc_endpoint.starts_with("ws://") || self.rpc_endpoint.starts_with("wss://")
            }
        };
        if !scheme_ok {
            return Err(ValidationError::invalid(
                "rpc_endpoint",
                format!(
                    "Endpoint scheme does not match network {}",
                    self.blockchain_network
                ),
            ));
        }
        if self.blockchain_network == BlockchainNetwork::Evm && self.contract_address.is_none() {
            return Err(ValidationError::MissingField("contract_address".to_string()));
        }
        Ok(())
    }
}

/// Single-event payload sent on chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnchorPayload {
    pub transaction_type: String,
    pub source_module: String,
    pub source_id: String,
    pub transaction_hash: String,
    pub organization_id: String,
    pub transaction_data: Value,
    pub timestamp: i64,
}

/// Batch payload sent on chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchPayload {
    pub batch_hash: String,
    pub transactions: Vec<AnchorPayload>,
    pub batch_timestamp: i64,
}

/// Chain-side status of a transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainTxStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

/// Result of handing a payload to the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainSubmission {
    pub hash: String,
    pub status: ChainTxStatus,
}

/// Chain facts about a submitted transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionDetails {
    pub hash: String,
    pub block_number: Option<u64>,
    pub transaction_index: Option<u32>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<u64>,
    pub status: ChainTxStatus,
}

impl TransactionDetails {
    /// Narrow chain integers to their persisted widths
    #[must_use]
    pub fn confirmation(&self) -> ConfirmationDetails {
        ConfirmationDetails {
            block_number: self.block_number.and_then(|v| i64::try_from(v).ok()),
            transaction_index: self.transaction_index.and_then(|v| i32::try_from(v).ok()),
            gas_used: self.gas_used.and_then(|v| i64::try_from(v).ok()),
            gas_price: self.gas_price.and_then(|v| i64::try_from(v).ok()),
        }
    }
}

/// Event emitted by the ledger contract or pallet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainEvent {
    pub event_id: String,
    pub transaction_hash: String,
    pub event_type: String,
    pub event_data: Value,
    pub block_number: u64,
    pub transaction_index: u32,
}

/// Outcome of an integrity check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub transaction_id: Uuid,
    pub hash_valid: bool,
    /// `None` when the chain was not consulted
    pub blockchain_confirmed: Option<bool>,
    pub blockchain_hash: Option<String>,
    pub block_number: Option<i64>,
    pub verification_timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Per-organization counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionStats {
    pub total: i64,
    pub pending: i64,
    pub submitting: i64,
    pub submitted: i64,
    pub confirmed: i64,
    pub failed: i64,
    pub total_gas_used: i64,
    /// Mean seconds from creation to confirmation
    pub average_confirmation_time: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

impl TransactionStats {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            total: 0,
            pending: 0,
            submitting: 0,
            submitted: 0,
            confirmed: 0,
            failed: 0,
            total_gas_used: 0,
            average_confirmation_time: None,
            last_updated: Utc::now(),
        }
    }
}

/// Read-only audit listing filter
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuditQuery {
    pub transaction_type: Option<String>,
    pub status: Option<TransactionStatus>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 1000, message = "Limit must be between 1 and 1000"))]
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
    #[validate(range(min = 0, message = "Offset must not be negative"))]
    #[serde(default)]
    pub offset: i64,
}

fn default_audit_limit() -> i64 {
    100
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            transaction_type: None,
            status: None,
            start_date: None,
            end_date: None,
            limit: default_audit_limit(),
            offset: 0,
        }
    }
}

impl AuditQuery {
    /// Whether a record passes the type/status/date filters
    #[must_use]
    pub fn matches(&self, tx: &LedgerTransaction) -> bool {
        self.transaction_type
            .as_deref()
            .is_none_or(|t| tx.transaction_type == t)
            && self.status.is_none_or(|s| tx.status == s)
            && self.start_date.is_none_or(|d| tx.created_at >= d)
            && self.end_date.is_none_or(|d| tx.created_at <= d)
    }
}

/// Offset-paginated audit listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditPage {
    pub transactions: Vec<LedgerTransaction>,
    pub total_count: i64,
    pub has_next: bool,
    pub has_previous: bool,
    pub next_offset: Option<i64>,
    pub previous_offset: Option<i64>,
}

impl AuditPage {
    #[must_use]
    pub fn new(transactions: Vec<LedgerTransaction>, total_count: i64, limit: i64, offset: i64) -> Self {
        let has_next = offset + limit < total_count;
        let has_previous = offset > 0;
        Self {
            transactions,
            total_count,
            has_next,
            has_previous,
            next_offset: has_next.then_some(offset + limit),
            previous_offset: has_previous.then(|| (offset - limit).max(0)),
        }
    }
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of the persistence and chain dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub blockchain: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, blockchain: HealthStatus) -> Self {
        let status = match (&database, &blockchain) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            blockchain,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn invoice() -> NewLedgerTransaction {
        NewLedgerTransaction::new(
            "invoice",
            "finance",
            "INV-001",
            json!({"amount": 1000.00, "currency": "USD", "description": "x"}),
            Some("org-1".to_string()),
        )
    }

    fn pending_tx() -> LedgerTransaction {
        let new = invoice();
        let hash = hash::transaction_hash(
            &new.transaction_type,
            &new.source_module,
            &new.source_id,
            &new.transaction_data,
            "org-1",
        )
        .unwrap();
        LedgerTransaction::from_new(&new, "org-1", hash, DEFAULT_MAX_RETRIES)
    }

    #[test]
    fn test_transaction_status_display_and_parsing() {
        let statuses = vec![
            (TransactionStatus::Pending, "pending"),
            (TransactionStatus::Submitting, "submitting"),
            (TransactionStatus::Submitted, "submitted"),
            (TransactionStatus::Confirmed, "confirmed"),
            (TransactionStatus::Failed, "failed"),
        ];

        for (status, string) in statuses {
            assert_eq!(status.as_str(), string);
            assert_eq!(status.to_string(), string);
            assert_eq!(TransactionStatus::from_str(string).unwrap(), status);
        }

        assert!(TransactionStatus::from_str("rejected").is_err());
    }

    #[test]
    fn test_network_aliases() {
        assert_eq!(BlockchainNetwork::from_str("ethereum").unwrap(), BlockchainNetwork::Evm);
        assert_eq!(BlockchainNetwork::from_str("Polygon").unwrap(), BlockchainNetwork::Evm);
        assert_eq!(
            BlockchainNetwork::from_str("substrate").unwrap(),
            BlockchainNetwork::Substrate
        );
        assert!(BlockchainNetwork::from_str("bitcoin").is_err());
    }

    #[test]
    fn test_new_transaction_requires_organization() {
        let mut new = invoice();
        new.organization_id = None;
        assert_eq!(
            new.check().unwrap_err(),
            ValidationError::MissingField("organization_id".to_string())
        );

        new.organization_id = Some("  ".to_string());
        assert!(new.check().is_err());
    }

    #[test]
    fn test_new_transaction_rejects_malformed_data() {
        let mut new = invoice();
        new.transaction_data = json!({});
        assert!(new.check().is_err());

        new.transaction_data = json!([1, 2, 3]);
        assert!(new.check().is_err());

        new.transaction_data = json!({"amount": 10, "currency": "USD"});
        assert!(new.check().is_err());

        assert_eq!(invoice().check().unwrap(), "org-1");
    }

    #[test]
    fn test_mark_submitted_is_idempotent() {
        let mut tx = pending_tx();
        assert!(tx.mark_submitted("0xabc"));
        let submitted_at = tx.submitted_at;
        assert!(!tx.mark_submitted("0xabc"));
        assert_eq!(tx.submitted_at, submitted_at);
        assert_eq!(tx.status, TransactionStatus::Submitted);
        assert_eq!(tx.blockchain_hash.as_deref(), Some("0xabc"));
    }

    #[test]
    fn test_mark_failed_exhausts_retries() {
        let mut tx = pending_tx();
        tx.mark_failed("boom");
        assert!(tx.can_retry());
        tx.mark_failed("boom");
        assert!(tx.can_retry());
        tx.mark_failed("boom");
        assert!(!tx.can_retry());
        assert_eq!(tx.retry_count, 3);
        tx.mark_failed("boom");
        assert!(!tx.can_retry());
        assert!(tx.failed_at.is_some());
        assert_eq!(tx.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_mark_confirmed_keeps_known_fields() {
        let mut tx = pending_tx();
        tx.mark_submitted("0xabc");
        tx.mark_confirmed(ConfirmationDetails {
            block_number: Some(12345),
            transaction_index: Some(0),
            gas_used: Some(21000),
            gas_price: Some(20_000_000_000),
        });
        assert!(tx.is_confirmed());
        assert_eq!(tx.block_number, Some(12345));
        tx.mark_confirmed(ConfirmationDetails::default());
        assert_eq!(tx.gas_used, Some(21000));
        assert!(!tx.mark_submitted("0xother"));
    }

    #[test]
    fn test_verify_hash_detects_tampering() {
        let mut tx = pending_tx();
        assert!(tx.verify_hash().unwrap());
        tx.transaction_data["amount"] = json!(1.0);
        assert!(!tx.verify_hash().unwrap());
    }

    #[test]
    fn test_configuration_validation() {
        let config = LedgerConfiguration::new("org-1", BlockchainNetwork::Substrate);
        assert!(config.check().is_ok());

        let mut bad = config.clone();
        bad.batch_size = 0;
        assert!(bad.check().is_err());

        let mut bad = config.clone();
        bad.batch_timeout_seconds = 0;
        assert!(bad.check().is_err());

        let mut bad = config.clone();
        bad.retry_attempts = 0;
        assert!(bad.check().is_err());

        let mut bad = config.clone();
        bad.rpc_endpoint = "http://localhost:9944".to_string();
        assert!(bad.check().is_err());

        let evm = LedgerConfiguration::new("org-1", BlockchainNetwork::Evm);
        assert!(evm.check().is_err());
        assert!(evm.with_contract("0x0000000000000000000000000000000000000001").check().is_ok());
    }

    #[test]
    fn test_audit_page_flags() {
        let page = AuditPage::new(vec![], 25, 10, 0);
        assert!(page.has_next);
        assert!(!page.has_previous);
        assert_eq!(page.next_offset, Some(10));
        assert_eq!(page.previous_offset, None);

        let page = AuditPage::new(vec![], 25, 10, 20);
        assert!(!page.has_next);
        assert!(page.has_previous);
        assert_eq!(page.next_offset, None);
        assert_eq!(page.previous_offset, Some(10));

        let page = AuditPage::new(vec![], 25, 10, 5);
        assert_eq!(page.previous_offset, Some(0));
    }

    #[test]
    fn test_batch_count_matches_members() {
        let batch = LedgerBatch::new("org-1", vec![Uuid::new_v4(), Uuid::new_v4()], "h".into());
        assert_eq!(batch.transaction_count(), 2);
        assert_eq!(batch.status, BatchStatus::Pending);
    }
}

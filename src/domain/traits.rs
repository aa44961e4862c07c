//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::AppError;
use super::types::{
    AnchorPayload, AuditQuery, BatchPayload, BatchStatus, BlockchainNetwork, ChainEvent, ChainSubmission,
    LedgerBatch, LedgerConfiguration, LedgerEvent, LedgerTransaction, TransactionDetails,
    TransactionStats, TransactionStatus,
};

/// Chain backend used to anchor payloads and query their fate
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Network family this client talks to
    fn network(&self) -> BlockchainNetwork;

    /// Whether the endpoint currently answers
    async fn is_connected(&self) -> bool;

    /// Anchor a single payload
    async fn submit_transaction(&self, payload: &AnchorPayload)
    -> Result<ChainSubmission, AppError>;

    /// Anchor a batch payload with one chain transaction
    async fn submit_batch(&self, payload: &BatchPayload) -> Result<ChainSubmission, AppError>;

    /// `true` iff the chain reports the transaction as successfully included
    async fn verify_transaction(&self, chain_tx_id: &str) -> Result<bool, AppError>;

    /// Chain facts about a transaction, `None` when the chain does not know it
    async fn get_transaction_details(
        &self,
        chain_tx_id: &str,
    ) -> Result<Option<TransactionDetails>, AppError>;

    /// Gas the chain expects to spend on a payload
    async fn estimate_gas(&self, payload: &AnchorPayload) -> Result<u64, AppError>;

    /// Latest block height
    async fn get_current_block_number(&self) -> Result<u64, AppError>;

    /// Events emitted by the ledger contract or pallet in a block range
    async fn get_events(
        &self,
        from_block: u64,
        to_block: Option<u64>,
        event_type: Option<&str>,
    ) -> Result<Vec<ChainEvent>, AppError> {
        let _ = (from_block, to_block, event_type);
        Err(AppError::NotSupported(
            "get_events not implemented".to_string(),
        ))
    }
}

/// Persistence contract for ledger records, batches, events and tenant configuration.
///
/// Every method that changes a transaction's status takes the audit event to append with
/// it, and implementations must apply both or neither.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Check store connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Insert a new record with its `transaction_logged` event.
    /// Fails with `DatabaseError::Duplicate` when `(source_module, source_id)` exists.
    async fn insert_transaction(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError>;

    async fn get_transaction(&self, id: Uuid) -> Result<Option<LedgerTransaction>, AppError>;

    async fn find_by_source(
        &self,
        source_module: &str,
        source_id: &str,
    ) -> Result<Option<LedgerTransaction>, AppError>;

    /// Fetch several records; missing ids are simply absent from the result
    async fn get_transactions(&self, ids: &[Uuid]) -> Result<Vec<LedgerTransaction>, AppError>;

    /// Atomically move a record from one of `from` to `submitting`.
    /// Returns `false` when another caller already holds it or it moved on.
    async fn claim_for_submission(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
    ) -> Result<bool, AppError>;

    /// Return a `submitting` record to `to` without touching its retry budget
    async fn release_claim(
        &self,
        id: Uuid,
        to: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Settle a `submitting` record as `submitted` under `blockchain_hash`, without an
    /// event. Used when the full transition after an accepted chain call cannot be written.
    async fn record_submission(&self, id: Uuid, blockchain_hash: &str) -> Result<bool, AppError>;

    /// Return every claim older than `older_than` to `pending`. Returns the count released.
    async fn release_stale_claims(
        &self,
        organization_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Persist lifecycle fields of `tx` and append `event`
    async fn save_transition(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError>;

    /// Records in `status`, oldest first
    async fn list_by_status(
        &self,
        organization_id: &str,
        status: TransactionStatus,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError>;

    /// Failed records with retry budget left. With `due_at` set, only those whose
    /// `next_retry_at` is unset or not after it.
    async fn list_retryable(
        &self,
        organization_id: &str,
        due_at: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError>;

    /// Filtered page (newest first) and the total match count
    async fn query_transactions(
        &self,
        organization_id: &str,
        query: &AuditQuery,
    ) -> Result<(Vec<LedgerTransaction>, i64), AppError>;

    async fn transaction_stats(&self, organization_id: &str)
    -> Result<TransactionStats, AppError>;

    /// Append an event that carries no status change
    async fn insert_event(&self, event: &LedgerEvent) -> Result<(), AppError>;

    /// Events of one record, oldest first
    async fn list_events(&self, transaction_id: Uuid) -> Result<Vec<LedgerEvent>, AppError>;

    async fn insert_batch(&self, batch: &LedgerBatch) -> Result<(), AppError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<LedgerBatch>, AppError>;

    /// Batches of an organization in `status`, oldest first
    async fn list_batches_by_status(
        &self,
        organization_id: &str,
        status: BatchStatus,
        limit: i64,
    ) -> Result<Vec<LedgerBatch>, AppError>;

    /// Update the batch row alone
    async fn update_batch(&self, batch: &LedgerBatch) -> Result<(), AppError>;

    /// Update the batch, its members and their events in one unit
    async fn commit_batch(
        &self,
        batch: &LedgerBatch,
        members: &[LedgerTransaction],
        events: &[LedgerEvent],
    ) -> Result<(), AppError>;

    async fn get_configuration(
        &self,
        organization_id: &str,
    ) -> Result<Option<LedgerConfiguration>, AppError>;

    async fn upsert_configuration(&self, config: &LedgerConfiguration) -> Result<(), AppError>;

    async fn list_active_configurations(&self) -> Result<Vec<LedgerConfiguration>, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChainTxStatus;

    struct MinimalChainClient;

    #[async_trait]
    impl ChainClient for MinimalChainClient {
        fn network(&self) -> BlockchainNetwork {
            BlockchainNetwork::Evm
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn submit_transaction(
            &self,
            _payload: &AnchorPayload,
        ) -> Result<ChainSubmission, AppError> {
            Ok(ChainSubmission {
                hash: "0x1".to_string(),
                status: ChainTxStatus::Submitted,
            })
        }

        async fn submit_batch(&self, _payload: &BatchPayload) -> Result<ChainSubmission, AppError> {
            Ok(ChainSubmission {
                hash: "0x2".to_string(),
                status: ChainTxStatus::Submitted,
            })
        }

        async fn verify_transaction(&self, _chain_tx_id: &str) -> Result<bool, AppError> {
            Ok(true)
        }

        async fn get_transaction_details(
            &self,
            _chain_tx_id: &str,
        ) -> Result<Option<TransactionDetails>, AppError> {
            Ok(None)
        }

        async fn estimate_gas(&self, _payload: &AnchorPayload) -> Result<u64, AppError> {
            Ok(21_000)
        }

        async fn get_current_block_number(&self) -> Result<u64, AppError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_chain_client_get_events_not_supported() {
        let client = MinimalChainClient;
        let result = client.get_events(0, None, None).await;
        assert!(matches!(result, Err(AppError::NotSupported(_))));
    }
}

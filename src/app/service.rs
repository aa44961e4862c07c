//! Transaction lifecycle orchestration for one organization.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::error::Elapsed;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::batch::BatchCoordinator;
use crate::domain::hash::{canonical_json, hmac_signature, transaction_hash};
use crate::domain::{
    AnchorPayload, AppError, AuditPage, AuditQuery, ChainClient, ChainTxStatus, ConfirmationDetails,
    DatabaseError, HealthResponse, HealthStatus, LedgerBatch, LedgerConfiguration, LedgerEvent,
    LedgerEventType, LedgerStore, LedgerTransaction, NewLedgerTransaction, TransactionStats,
    TransactionStatus, ValidationError, VerificationResult,
};

/// First retry delay in seconds; doubles with every failed attempt
const BACKOFF_BASE_SECS: i64 = 2;

/// Maximum backoff duration in seconds (5 minutes)
const MAX_BACKOFF_SECS: i64 = 300;

/// Records handled per retry or reconcile pass when the caller gives no limit
const DEFAULT_PASS_LIMIT: i64 = 100;

/// Writes attempted for a submission the chain has already accepted
const PERSIST_ATTEMPTS: u32 = 3;

const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Resource limits for chain calls
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Chain calls allowed in flight at once
    pub max_in_flight: usize,
    /// Upper bound on a single chain call
    pub call_timeout: Duration,
    /// Key for signing anchored payloads in the event log
    pub signing_secret: Option<Arc<SecretString>>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            call_timeout: Duration::from_secs(30),
            signing_secret: None,
        }
    }
}

/// Semaphore plus timeout wrapped around every chain call
#[derive(Clone)]
pub(crate) struct ChainGate {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ChainGate {
    pub(crate) fn new(settings: &ServiceSettings) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            timeout: settings.call_timeout,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `call` once a permit is free. The outer error means the call timed out.
    pub(crate) async fn run<T, F>(&self, call: F) -> Result<Result<T, AppError>, Elapsed>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Ok(Err(AppError::Internal(e.to_string()))),
        };
        tokio::time::timeout(self.timeout, call).await
    }
}

/// Exponential backoff in seconds for the given number of failed attempts, capped
pub(crate) fn calculate_backoff(retry_count: i32) -> i64 {
    let exponent = (retry_count.max(1) - 1).min(16) as u32;
    BACKOFF_BASE_SECS
        .saturating_mul(2_i64.pow(exponent))
        .min(MAX_BACKOFF_SECS)
}

/// Next retry time for a failed record: backoff plus up to half of it as jitter
pub(crate) fn next_retry_at(retry_count: i32, failed_at: DateTime<Utc>) -> DateTime<Utc> {
    let delay_ms = calculate_backoff(retry_count) * 1000;
    let jitter_ms = rand::thread_rng().gen_range(0..=delay_ms / 2);
    failed_at + ChronoDuration::milliseconds(delay_ms + jitter_ms)
}

/// Record a failure on `tx` and schedule its next attempt when budget remains
pub(crate) fn fail_with_backoff(tx: &mut LedgerTransaction, message: impl Into<String>) {
    tx.mark_failed(message);
    tx.next_retry_at = if tx.can_retry() {
        Some(next_retry_at(tx.retry_count, tx.failed_at.unwrap_or_else(Utc::now)))
    } else {
        None
    };
}

pub(crate) fn failure_event(tx: &LedgerTransaction, retryable: bool) -> LedgerEvent {
    LedgerEvent::new(
        tx.id,
        LedgerEventType::TransactionFailed,
        json!({
            "error": tx.error_message,
            "retry_count": tx.retry_count,
            "max_retries": tx.max_retries,
            "retryable": retryable && tx.can_retry(),
            "next_retry_at": tx.next_retry_at,
        }),
    )
}

/// Lifecycle service bound to one organization's configuration and chain client
pub struct TransactionService {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    config: LedgerConfiguration,
    gate: ChainGate,
    signing_secret: Option<Arc<SecretString>>,
    batches: BatchCoordinator,
}

impl TransactionService {
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        config: LedgerConfiguration,
        settings: ServiceSettings,
    ) -> Self {
        let gate = ChainGate::new(&settings);
        let batches = BatchCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&chain),
            config.clone(),
            gate.clone(),
        );
        Self {
            store,
            chain,
            config,
            gate,
            signing_secret: settings.signing_secret,
            batches,
        }
    }

    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.config.organization_id
    }

    #[must_use]
    pub fn configuration(&self) -> &LedgerConfiguration {
        &self.config
    }

    #[must_use]
    pub fn batches(&self) -> &BatchCoordinator {
        &self.batches
    }

    fn ensure_tenant(&self, organization_id: &str) -> Result<(), AppError> {
        if organization_id != self.config.organization_id {
            return Err(ValidationError::invalid(
                "organization_id",
                format!(
                    "Service for {} cannot act on behalf of {}",
                    self.config.organization_id, organization_id
                ),
            )
            .into());
        }
        Ok(())
    }

    /// HMAC over the canonical payload, when a signing key is configured
    fn sign_payload(&self, payload: &AnchorPayload) -> Result<Option<String>, AppError> {
        let Some(secret) = &self.signing_secret else {
            return Ok(None);
        };
        let canonical = canonical_json(&serde_json::to_value(payload)?)?;
        hmac_signature(&canonical, secret.expose_secret().as_bytes()).map(Some)
    }

    async fn load(&self, id: Uuid) -> Result<LedgerTransaction, AppError> {
        let tx = self
            .store
            .get_transaction(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("ledger transaction {}", id)))?;
        self.ensure_tenant(&tx.organization_id)?;
        Ok(tx)
    }

    /// Validate, hash and persist a producer event as a pending record.
    /// Resubmitting an identical event returns the stored record.
    #[instrument(skip(self, new), fields(module = %new.source_module, source_id = %new.source_id))]
    pub async fn create_transaction(
        &self,
        new: &NewLedgerTransaction,
    ) -> Result<LedgerTransaction, AppError> {
        let organization_id = new.check()?;
        self.ensure_tenant(organization_id)?;

        let hash = transaction_hash(
            &new.transaction_type,
            &new.source_module,
            &new.source_id,
            &new.transaction_data,
            organization_id,
        )?;

        if let Some(existing) = self
            .store
            .find_by_source(&new.source_module, &new.source_id)
            .await?
        {
            return Self::resolve_duplicate(existing, &hash);
        }

        let tx = LedgerTransaction::from_new(new, organization_id, hash, self.config.retry_attempts);
        let event = LedgerEvent::new(
            tx.id,
            LedgerEventType::TransactionLogged,
            json!({
                "transaction_type": tx.transaction_type,
                "source_module": tx.source_module,
                "source_id": tx.source_id,
                "hash": tx.hash,
            }),
        );

        match self.store.insert_transaction(&tx, &event).await {
            Ok(()) => {
                info!(id = %tx.id, hash = %tx.hash, "Ledger transaction created");
                Ok(tx)
            }
            Err(AppError::Database(DatabaseError::Duplicate(_))) => {
                // Lost an insert race; the winner's record decides
                let existing = self
                    .store
                    .find_by_source(&new.source_module, &new.source_id)
                    .await?
                    .ok_or_else(|| {
                        DatabaseError::NotFound(format!(
                            "{}/{}",
                            new.source_module, new.source_id
                        ))
                    })?;
                Self::resolve_duplicate(existing, &tx.hash)
            }
            Err(e) => Err(e),
        }
    }

    fn resolve_duplicate(
        existing: LedgerTransaction,
        hash: &str,
    ) -> Result<LedgerTransaction, AppError> {
        if existing.hash == hash {
            debug!(id = %existing.id, "Identical event already anchored");
            return Ok(existing);
        }
        warn!(
            id = %existing.id,
            module = %existing.source_module,
            source_id = %existing.source_id,
            "Conflicting event for an anchored source"
        );
        Err(AppError::DuplicateSource {
            source_module: existing.source_module,
            source_id: existing.source_id,
        })
    }

    /// Send a record to the chain.
    ///
    /// Returns `true` when the record is (or already was) submitted. `false` means another
    /// caller holds it, the chain call failed or timed out, or the record is exhausted.
    #[instrument(skip(self, tx), fields(id = %tx.id))]
    pub async fn submit_transaction(&self, tx: &LedgerTransaction) -> Result<bool, AppError> {
        let current = self.load(tx.id).await?;
        let prior = current.status;
        match prior {
            TransactionStatus::Submitted | TransactionStatus::Confirmed => return Ok(true),
            TransactionStatus::Submitting => return Ok(false),
            TransactionStatus::Failed if !current.can_retry() => {
                debug!(retry_count = current.retry_count, "Retry budget exhausted");
                return Ok(false);
            }
            TransactionStatus::Pending | TransactionStatus::Failed => {}
        }

        if !self.store.claim_for_submission(current.id, &[prior]).await? {
            debug!("Submission claim lost to a concurrent caller");
            return Ok(false);
        }

        self.submit_claimed(current, prior).await
    }

    /// Hand a claimed record back to `prior` after a local error, keeping its retry budget
    async fn abandon_claim(&self, id: Uuid, prior: TransactionStatus, cause: &AppError) {
        let message = format!("Submission abandoned: {}", cause);
        if let Err(e) = self.store.release_claim(id, prior, Some(message.as_str())).await {
            error!(id = %id, error = ?e, "Could not release submission claim");
        }
    }

    /// Work between claiming a record and calling the chain. On error the claim is still held.
    async fn prepare_submission(
        &self,
        tx: &mut LedgerTransaction,
        prior: TransactionStatus,
    ) -> Result<Option<(AnchorPayload, Option<String>)>, AppError> {
        let actual = tx.compute_hash()?;
        if !actual.eq_ignore_ascii_case(&tx.hash) {
            let mismatch = AppError::HashMismatch {
                expected: tx.hash.clone(),
                actual,
            };
            warn!(id = %tx.id, error = %mismatch, "Refusing to anchor tampered record");
            fail_with_backoff(tx, mismatch.to_string());
            let event = failure_event(tx, false);
            self.store.save_transition(tx, &event).await?;
            return Ok(None);
        }

        if prior == TransactionStatus::Failed {
            self.store
                .insert_event(&LedgerEvent::new(
                    tx.id,
                    LedgerEventType::RetryAttempted,
                    json!({ "retry_count": tx.retry_count, "previous_error": tx.error_message }),
                ))
                .await?;
        }

        let payload = tx.anchor_payload();
        let signature = self.sign_payload(&payload)?;
        Ok(Some((payload, signature)))
    }

    /// Record an accepted chain submission. The claim must never fall back to pending
    /// from here, so a failed write leaves the record submitted under its chain hash.
    async fn persist_submission(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
        blockchain_hash: &str,
    ) -> Result<(), AppError> {
        let mut attempt = 1;
        let cause = loop {
            match self.store.save_transition(tx, event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(id = %tx.id, attempt, error = ?e, "Retrying write of accepted submission");
                    attempt += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => break e,
            }
        };

        error!(id = %tx.id, blockchain_hash, error = ?cause, "Anchored on chain but failed to record it");
        if let Err(e) = self.store.record_submission(tx.id, blockchain_hash).await {
            error!(id = %tx.id, blockchain_hash, error = ?e, "Submission left claimed; resolve before releasing stale claims");
        }
        Err(cause)
    }

    async fn submit_claimed(
        &self,
        mut tx: LedgerTransaction,
        prior: TransactionStatus,
    ) -> Result<bool, AppError> {
        let (payload, signature) = match self.prepare_submission(&mut tx, prior).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return Ok(false),
            Err(e) => {
                self.abandon_claim(tx.id, prior, &e).await;
                return Err(e);
            }
        };

        let outcome = self
            .gate
            .run(self.chain.submit_transaction(&payload))
            .await;

        let submission = match outcome {
            Err(_) => {
                let message = format!(
                    "Chain submission timed out after {:?}",
                    self.gate.timeout()
                );
                warn!(id = %tx.id, "{}", message);
                self.store
                    .release_claim(tx.id, prior, Some(message.as_str()))
                    .await?;
                return Ok(false);
            }
            Ok(Err(e)) => {
                warn!(id = %tx.id, error = ?e, retryable = e.is_retryable(), "Chain submission failed");
                fail_with_backoff(&mut tx, e.to_string());
                let event = failure_event(&tx, true);
                if let Err(write_error) = self.store.save_transition(&tx, &event).await {
                    self.abandon_claim(tx.id, prior, &write_error).await;
                    return Err(write_error);
                }
                return Ok(false);
            }
            Ok(Ok(submission)) => submission,
        };

        tx.mark_submitted(&submission.hash);
        let event = LedgerEvent::new(
            tx.id,
            LedgerEventType::TransactionSubmitted,
            json!({
                "blockchain_hash": submission.hash,
                "network": self.chain.network().as_str(),
                "retry_count": tx.retry_count,
                "payload_signature": signature,
            }),
        );
        self.persist_submission(&tx, &event, &submission.hash).await?;
        info!(id = %tx.id, blockchain_hash = %submission.hash, "Ledger transaction submitted");

        if self.config.auto_confirm && submission.status == ChainTxStatus::Confirmed {
            self.confirm_transaction(&tx, ConfirmationDetails::default())
                .await?;
        }
        Ok(true)
    }

    /// Mark a submitted record confirmed. Fields not supplied are taken from the chain;
    /// without a supplied block number the chain must report the transaction as confirmed.
    #[instrument(skip(self, tx, details), fields(id = %tx.id))]
    pub async fn confirm_transaction(
        &self,
        tx: &LedgerTransaction,
        details: ConfirmationDetails,
    ) -> Result<bool, AppError> {
        let mut current = self.load(tx.id).await?;
        match current.status {
            TransactionStatus::Confirmed => return Ok(true),
            TransactionStatus::Submitted => {}
            status => {
                debug!(%status, "Only submitted records can be confirmed");
                return Ok(false);
            }
        }
        let Some(chain_hash) = current.blockchain_hash.clone() else {
            return Ok(false);
        };

        let complete = details.block_number.is_some()
            && details.transaction_index.is_some()
            && details.gas_used.is_some()
            && details.gas_price.is_some();

        let mut merged = details;
        if !complete {
            let chain_details = match self
                .gate
                .run(self.chain.get_transaction_details(&chain_hash))
                .await
            {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    warn!(error = ?e, "Could not fetch chain details; record stays submitted");
                    return Ok(false);
                }
                Err(_) => {
                    warn!("Chain lookup timed out; record stays submitted");
                    return Ok(false);
                }
            };

            match chain_details {
                Some(found) if found.status == ChainTxStatus::Failed => {
                    fail_with_backoff(&mut current, "Transaction failed on chain");
                    let event = failure_event(&current, true);
                    self.store.save_transition(&current, &event).await?;
                    return Ok(false);
                }
                Some(found) => {
                    if details.block_number.is_none() && found.status != ChainTxStatus::Confirmed {
                        debug!(status = ?found.status, "Not yet confirmed on chain");
                        return Ok(false);
                    }
                    let from_chain = found.confirmation();
                    merged = ConfirmationDetails {
                        block_number: details.block_number.or(from_chain.block_number),
                        transaction_index: details
                            .transaction_index
                            .or(from_chain.transaction_index),
                        gas_used: details.gas_used.or(from_chain.gas_used),
                        gas_price: details.gas_price.or(from_chain.gas_price),
                    };
                }
                None if details.block_number.is_none() => return Ok(false),
                None => {}
            }
        }

        current.mark_confirmed(merged);
        let event = LedgerEvent::new(
            current.id,
            LedgerEventType::TransactionConfirmed,
            json!({
                "blockchain_hash": chain_hash,
                "block_number": current.block_number,
                "transaction_index": current.transaction_index,
                "gas_used": current.gas_used,
                "gas_price": current.gas_price,
            }),
        );
        self.store.save_transition(&current, &event).await?;
        info!(id = %current.id, block_number = ?current.block_number, "Ledger transaction confirmed");
        Ok(true)
    }

    /// Integrity check against the stored record and, optionally, the chain
    #[instrument(skip(self, tx), fields(id = %tx.id))]
    pub async fn verify_transaction(
        &self,
        tx: &LedgerTransaction,
        verify_hash: bool,
        verify_blockchain: bool,
    ) -> Result<VerificationResult, AppError> {
        let current = self.load(tx.id).await?;
        let mut result = VerificationResult {
            transaction_id: current.id,
            hash_valid: true,
            blockchain_confirmed: None,
            blockchain_hash: current.blockchain_hash.clone(),
            block_number: current.block_number,
            verification_timestamp: Utc::now(),
            error_message: None,
        };

        if verify_hash {
            let actual = current.compute_hash()?;
            result.hash_valid = actual.eq_ignore_ascii_case(&current.hash);
            if !result.hash_valid {
                let mismatch = AppError::HashMismatch {
                    expected: current.hash.clone(),
                    actual,
                };
                warn!(error = %mismatch, "Ledger record failed hash verification");
                result.error_message = Some(mismatch.to_string());
            }
        }

        if verify_blockchain {
            if let Some(chain_hash) = current.blockchain_hash.as_deref() {
                let confirmed = match self.gate.run(self.chain.verify_transaction(chain_hash)).await {
                    Ok(Ok(confirmed)) => confirmed,
                    Ok(Err(e)) => {
                        warn!(error = ?e, "Chain verification failed");
                        false
                    }
                    Err(_) => {
                        warn!("Chain verification timed out");
                        false
                    }
                };
                result.blockchain_confirmed = Some(confirmed);
                if !confirmed {
                    result.error_message = Some("Blockchain verification failed".to_string());
                }
            }
        }

        self.store
            .insert_event(&LedgerEvent::new(
                current.id,
                LedgerEventType::HashVerified,
                serde_json::to_value(&result)?,
            ))
            .await?;
        Ok(result)
    }

    /// Group records into a batch committed to by their Merkle root
    pub async fn create_batch(
        &self,
        transaction_ids: &[Uuid],
        organization_id: &str,
    ) -> Result<LedgerBatch, AppError> {
        self.ensure_tenant(organization_id)?;
        self.batches.create_batch(transaction_ids).await
    }

    /// Anchor a batch with one chain call
    pub async fn submit_batch(&self, batch: &LedgerBatch) -> Result<bool, AppError> {
        self.ensure_tenant(&batch.organization_id)?;
        self.batches.submit_batch(batch).await
    }

    async fn resubmit_all(&self, candidates: Vec<LedgerTransaction>) -> (usize, usize) {
        let mut succeeded = 0;
        let mut failed = 0;
        for tx in candidates {
            match self.submit_transaction(&tx).await {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(id = %tx.id, error = ?e, "Retry attempt errored");
                    failed += 1;
                }
            }
        }
        (succeeded, failed)
    }

    /// Submit pending records one by one, oldest first
    #[instrument(skip(self))]
    pub async fn submit_pending(
        &self,
        organization_id: &str,
        limit: i64,
    ) -> Result<(usize, usize), AppError> {
        self.ensure_tenant(organization_id)?;
        let pending = self
            .store
            .list_by_status(organization_id, TransactionStatus::Pending, limit)
            .await?;
        Ok(self.resubmit_all(pending).await)
    }

    /// Resubmit failed records with retry budget left, oldest first, ignoring backoff
    #[instrument(skip(self))]
    pub async fn retry_failed_transactions(
        &self,
        organization_id: &str,
        limit: Option<i64>,
    ) -> Result<(usize, usize), AppError> {
        self.ensure_tenant(organization_id)?;
        let candidates = self
            .store
            .list_retryable(organization_id, None, limit.unwrap_or(DEFAULT_PASS_LIMIT))
            .await?;
        if candidates.is_empty() {
            return Ok((0, 0));
        }
        info!(count = candidates.len(), "Retrying failed ledger transactions");
        Ok(self.resubmit_all(candidates).await)
    }

    /// Resubmit failed records whose backoff has elapsed
    #[instrument(skip(self))]
    pub async fn retry_due_transactions(
        &self,
        organization_id: &str,
        limit: i64,
    ) -> Result<(usize, usize), AppError> {
        self.ensure_tenant(organization_id)?;
        let candidates = self
            .store
            .list_retryable(organization_id, Some(Utc::now()), limit)
            .await?;
        if candidates.is_empty() {
            return Ok((0, 0));
        }
        debug!(count = candidates.len(), "Retrying due ledger transactions");
        Ok(self.resubmit_all(candidates).await)
    }

    /// Re-query the chain for submitted records and settle them.
    /// Returns `(confirmed, failed)` counts.
    #[instrument(skip(self))]
    pub async fn reconcile_submitted(
        &self,
        organization_id: &str,
        limit: i64,
    ) -> Result<(usize, usize), AppError> {
        self.ensure_tenant(organization_id)?;
        let submitted = self
            .store
            .list_by_status(organization_id, TransactionStatus::Submitted, limit)
            .await?;

        let mut confirmed = 0;
        let mut failed = 0;
        for tx in submitted {
            let Some(chain_hash) = tx.blockchain_hash.as_deref() else {
                continue;
            };
            let details = match self
                .gate
                .run(self.chain.get_transaction_details(chain_hash))
                .await
            {
                Ok(Ok(Some(details))) => details,
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => {
                    warn!(id = %tx.id, error = ?e, "Reconcile lookup failed");
                    continue;
                }
                Err(_) => {
                    warn!(id = %tx.id, "Reconcile lookup timed out");
                    continue;
                }
            };

            match details.status {
                ChainTxStatus::Confirmed => {
                    if self.confirm_transaction(&tx, details.confirmation()).await? {
                        confirmed += 1;
                    }
                }
                ChainTxStatus::Failed => {
                    let mut tx = tx;
                    fail_with_backoff(&mut tx, "Transaction failed on chain");
                    let event = failure_event(&tx, true);
                    self.store.save_transition(&tx, &event).await?;
                    failed += 1;
                }
                ChainTxStatus::Pending | ChainTxStatus::Submitted => {}
            }
        }

        if confirmed + failed > 0 {
            info!(confirmed, failed, "Reconciled submitted ledger transactions");
        }
        Ok((confirmed, failed))
    }

    /// Return claims held longer than `older_than` (crashed submitters) to pending
    #[instrument(skip(self))]
    pub async fn release_stale_claims(
        &self,
        organization_id: &str,
        older_than: Duration,
    ) -> Result<u64, AppError> {
        self.ensure_tenant(organization_id)?;
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than)
                .map_err(|e| AppError::Internal(e.to_string()))?;
        let released = self
            .store
            .release_stale_claims(organization_id, cutoff)
            .await?;
        if released > 0 {
            warn!(released, "Released stale submission claims");
        }
        Ok(released)
    }

    pub async fn get_transaction(
        &self,
        id: Uuid,
        organization_id: &str,
    ) -> Result<Option<LedgerTransaction>, AppError> {
        self.ensure_tenant(organization_id)?;
        Ok(self
            .store
            .get_transaction(id)
            .await?
            .filter(|tx| tx.organization_id == organization_id))
    }

    /// Read-only audit listing, newest first
    #[instrument(skip(self, query))]
    pub async fn list_transactions(
        &self,
        organization_id: &str,
        query: &AuditQuery,
    ) -> Result<AuditPage, AppError> {
        self.ensure_tenant(organization_id)?;
        query.validate().map_err(ValidationError::from)?;
        let (transactions, total) = self
            .store
            .query_transactions(organization_id, query)
            .await?;
        Ok(AuditPage::new(transactions, total, query.limit, query.offset))
    }

    pub async fn list_events(&self, transaction_id: Uuid) -> Result<Vec<LedgerEvent>, AppError> {
        self.load(transaction_id).await?;
        self.store.list_events(transaction_id).await
    }

    pub async fn get_transaction_stats(
        &self,
        organization_id: &str,
    ) -> Result<TransactionStats, AppError> {
        self.ensure_tenant(organization_id)?;
        self.store.transaction_stats(organization_id).await
    }

    /// Perform health check on all dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let database = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let blockchain = if self.chain.is_connected().await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthResponse::new(database, blockchain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff() {
        assert_eq!(calculate_backoff(0), 2);
        assert_eq!(calculate_backoff(1), 2);
        assert_eq!(calculate_backoff(2), 4);
        assert_eq!(calculate_backoff(3), 8);
        assert_eq!(calculate_backoff(4), 16);
        assert_eq!(calculate_backoff(7), 128);
        assert_eq!(calculate_backoff(8), 256);
        assert_eq!(calculate_backoff(9), 300); // Capped
        assert_eq!(calculate_backoff(50), 300);
    }

    #[test]
    fn test_next_retry_at_stays_within_jitter_window() {
        let failed_at = Utc::now();
        for retry_count in 1..6 {
            let delay = calculate_backoff(retry_count);
            let next = next_retry_at(retry_count, failed_at);
            let waited = (next - failed_at).num_milliseconds();
            assert!(waited >= delay * 1000);
            assert!(waited <= delay * 1000 + delay * 500);
        }
    }

    #[test]
    fn test_service_settings_default() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.max_in_flight, 8);
        assert_eq!(settings.call_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_chain_gate_times_out() {
        let gate = ChainGate::new(&ServiceSettings {
            max_in_flight: 1,
            call_timeout: Duration::from_millis(10),
            signing_secret: None,
        });
        let slow = gate
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, AppError>(())
            })
            .await;
        assert!(slow.is_err());

        let fast = gate.run(async { Ok::<_, AppError>(7) }).await;
        assert_eq!(fast.unwrap().unwrap(), 7);
    }
}

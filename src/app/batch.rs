//! Batch anchoring: many records committed on chain under one Merkle root.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::service::{ChainGate, fail_with_backoff, failure_event};
use crate::domain::hash::merkle_root;
use crate::domain::{
    AppError, BatchPayload, BatchStatus, ChainClient, ChainTxStatus, DatabaseError, LedgerBatch,
    LedgerConfiguration, LedgerEvent, LedgerEventType, LedgerStore, LedgerTransaction,
    TransactionStatus, ValidationError,
};

/// Batches formed per assembly pass at most
const MAX_BATCHES_PER_PASS: i64 = 10;

/// Whether a record may still be anchored as part of a batch
fn is_anchorable(tx: &LedgerTransaction) -> bool {
    tx.status == TransactionStatus::Pending || tx.can_retry()
}

pub struct BatchCoordinator {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainClient>,
    config: LedgerConfiguration,
    gate: ChainGate,
}

impl BatchCoordinator {
    pub(crate) fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainClient>,
        config: LedgerConfiguration,
        gate: ChainGate,
    ) -> Self {
        Self {
            store,
            chain,
            config,
            gate,
        }
    }

    async fn load_batch(&self, id: Uuid) -> Result<LedgerBatch, AppError> {
        self.store
            .get_batch(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("ledger batch {}", id)).into())
    }

    /// Members in the batch's order
    async fn load_members(&self, batch: &LedgerBatch) -> Result<Vec<LedgerTransaction>, AppError> {
        let mut by_id: HashMap<Uuid, LedgerTransaction> = self
            .store
            .get_transactions(&batch.transaction_ids)
            .await?
            .into_iter()
            .map(|tx| (tx.id, tx))
            .collect();

        batch
            .transaction_ids
            .iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .filter(|tx| tx.organization_id == batch.organization_id)
                    .ok_or_else(|| {
                        AppError::from(ValidationError::invalid(
                            "transaction_ids",
                            format!("Unknown ledger transaction {}", id),
                        ))
                    })
            })
            .collect()
    }

    /// Persist a pending batch over the given records, in the order given
    #[instrument(skip(self, transaction_ids), fields(count = transaction_ids.len()))]
    pub async fn create_batch(&self, transaction_ids: &[Uuid]) -> Result<LedgerBatch, AppError> {
        if transaction_ids.is_empty() {
            return Err(ValidationError::invalid("transaction_ids", "A batch needs members").into());
        }
        let mut seen = HashSet::with_capacity(transaction_ids.len());
        if let Some(dup) = transaction_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ValidationError::invalid(
                "transaction_ids",
                format!("Ledger transaction {} listed twice", dup),
            )
            .into());
        }

        let mut batch = LedgerBatch::new(
            &self.config.organization_id,
            transaction_ids.to_vec(),
            String::new(),
        );
        let members = self.load_members(&batch).await?;
        if let Some(settled) = members.iter().find(|tx| !is_anchorable(tx)) {
            return Err(ValidationError::invalid(
                "transaction_ids",
                format!(
                    "Ledger transaction {} is {} with {}/{} retries used and cannot join a batch",
                    settled.id, settled.status, settled.retry_count, settled.max_retries
                ),
            )
            .into());
        }
        let hashes: Vec<&str> = members.iter().map(|tx| tx.hash.as_str()).collect();
        batch.batch_hash = merkle_root(&hashes);

        self.store.insert_batch(&batch).await?;
        info!(batch_id = %batch.id, batch_hash = %batch.batch_hash, "Ledger batch created");
        Ok(batch)
    }

    /// Anchor the batch with a single chain call.
    ///
    /// Only pending members and failed members with retries left take part. On success
    /// they move to submitted together with the batch. On failure or timeout the batch is
    /// marked failed and each of them is charged one retry in the same commit; confirmed
    /// and exhausted members are never touched.
    #[instrument(skip(self, batch), fields(batch_id = %batch.id))]
    pub async fn submit_batch(&self, batch: &LedgerBatch) -> Result<bool, AppError> {
        let mut batch = self.load_batch(batch.id).await?;
        match batch.status {
            BatchStatus::Submitted | BatchStatus::Confirmed => return Ok(true),
            BatchStatus::Pending | BatchStatus::Failed => {}
        }

        let members = self.load_members(&batch).await?;
        for member in &members {
            let actual = member.compute_hash()?;
            if !actual.eq_ignore_ascii_case(&member.hash) {
                let mismatch = AppError::HashMismatch {
                    expected: member.hash.clone(),
                    actual,
                };
                warn!(id = %member.id, error = %mismatch, "Batch member failed hash verification");
                batch.mark_failed(format!("Member {}: {}", member.id, mismatch));
                let mut tampered = member.clone();
                let (changed, events) = if is_anchorable(&tampered) {
                    fail_with_backoff(&mut tampered, mismatch.to_string());
                    let event = failure_event(&tampered, false);
                    (vec![tampered], vec![event])
                } else {
                    (Vec::new(), Vec::new())
                };
                self.store.commit_batch(&batch, &changed, &events).await?;
                return Ok(false);
            }
        }

        if !members.iter().any(is_anchorable) {
            warn!("No batch member is pending or retryable");
            batch.mark_failed("No member is pending or retryable");
            self.store.update_batch(&batch).await?;
            return Ok(false);
        }

        let payload = BatchPayload {
            batch_hash: batch.batch_hash.clone(),
            transactions: members.iter().map(LedgerTransaction::anchor_payload).collect(),
            batch_timestamp: Utc::now().timestamp(),
        };

        let submission = match self.gate.run(self.chain.submit_batch(&payload)).await {
            Ok(Ok(submission)) => submission,
            Ok(Err(e)) => {
                warn!(error = ?e, retryable = e.is_retryable(), "Batch submission failed");
                self.fail_batch(batch, members, e.to_string()).await?;
                return Ok(false);
            }
            Err(_) => {
                let message = format!("Batch submission timed out after {:?}", self.gate.timeout());
                warn!("{}", message);
                self.fail_batch(batch, members, message).await?;
                return Ok(false);
            }
        };

        batch.mark_submitted(&submission.hash);
        let mut changed = Vec::with_capacity(members.len());
        let mut events = Vec::with_capacity(members.len());
        for mut member in members {
            if !is_anchorable(&member) {
                continue;
            }
            member.mark_submitted(&submission.hash);
            events.push(LedgerEvent::new(
                member.id,
                LedgerEventType::BatchProcessed,
                json!({
                    "batch_id": batch.id,
                    "batch_hash": batch.batch_hash,
                    "blockchain_hash": submission.hash,
                    "status": member.status,
                }),
            ));
            changed.push(member);
        }

        self.store.commit_batch(&batch, &changed, &events).await?;
        info!(
            blockchain_hash = %submission.hash,
            members = changed.len(),
            "Ledger batch submitted"
        );

        if self.config.auto_confirm && submission.status == ChainTxStatus::Confirmed {
            self.confirm_batch(&batch).await?;
        }
        Ok(true)
    }

    /// Mark the batch failed and charge one retry to every member still in play
    async fn fail_batch(
        &self,
        mut batch: LedgerBatch,
        members: Vec<LedgerTransaction>,
        message: String,
    ) -> Result<(), AppError> {
        batch.mark_failed(message.as_str());
        let mut changed = Vec::with_capacity(members.len());
        let mut events = Vec::with_capacity(members.len());
        for mut member in members.into_iter().filter(is_anchorable) {
            fail_with_backoff(&mut member, message.as_str());
            events.push(failure_event(&member, true));
            changed.push(member);
        }
        self.store.commit_batch(&batch, &changed, &events).await?;
        info!(members = changed.len(), "Ledger batch failed; members charged a retry");
        Ok(())
    }

    /// Settle a submitted batch from the chain's view of its transaction
    #[instrument(skip(self, batch), fields(batch_id = %batch.id))]
    pub async fn confirm_batch(&self, batch: &LedgerBatch) -> Result<bool, AppError> {
        let mut batch = self.load_batch(batch.id).await?;
        match batch.status {
            BatchStatus::Confirmed => return Ok(true),
            BatchStatus::Submitted => {}
            BatchStatus::Pending | BatchStatus::Failed => return Ok(false),
        }
        let Some(chain_hash) = batch.blockchain_hash.clone() else {
            return Ok(false);
        };

        let details = match self
            .gate
            .run(self.chain.get_transaction_details(&chain_hash))
            .await
        {
            Ok(Ok(Some(details))) => details,
            Ok(Ok(None)) => return Ok(false),
            Ok(Err(e)) => {
                warn!(error = ?e, "Could not fetch batch details");
                return Ok(false);
            }
            Err(_) => {
                warn!("Batch lookup timed out");
                return Ok(false);
            }
        };

        let anchored: Vec<LedgerTransaction> = self
            .load_members(&batch)
            .await?
            .into_iter()
            .filter(|tx| {
                tx.status == TransactionStatus::Submitted
                    && tx.blockchain_hash.as_deref() == Some(chain_hash.as_str())
            })
            .collect();

        let mut events = Vec::with_capacity(anchored.len());
        let mut changed = Vec::with_capacity(anchored.len());
        let confirmed = match details.status {
            ChainTxStatus::Confirmed => {
                let confirmation = details.confirmation();
                batch.mark_confirmed(confirmation.block_number, confirmation.gas_used);
                for mut member in anchored {
                    member.mark_confirmed(confirmation);
                    events.push(LedgerEvent::new(
                        member.id,
                        LedgerEventType::TransactionConfirmed,
                        json!({
                            "batch_id": batch.id,
                            "blockchain_hash": chain_hash,
                            "block_number": member.block_number,
                        }),
                    ));
                    changed.push(member);
                }
                true
            }
            ChainTxStatus::Failed => {
                batch.mark_failed("Batch transaction failed on chain");
                for mut member in anchored {
                    fail_with_backoff(&mut member, "Batch transaction failed on chain");
                    events.push(failure_event(&member, true));
                    changed.push(member);
                }
                false
            }
            ChainTxStatus::Pending | ChainTxStatus::Submitted => {
                debug!("Batch not yet final on chain");
                return Ok(false);
            }
        };

        self.store.commit_batch(&batch, &changed, &events).await?;
        info!(status = %batch.status, members = changed.len(), "Ledger batch settled");
        Ok(confirmed)
    }

    /// Settle submitted batches, oldest first. Returns `(confirmed, failed)` counts.
    #[instrument(skip(self), fields(org = %self.config.organization_id))]
    pub async fn reconcile_submitted(&self, limit: i64) -> Result<(usize, usize), AppError> {
        let submitted = self
            .store
            .list_batches_by_status(&self.config.organization_id, BatchStatus::Submitted, limit)
            .await?;

        let mut confirmed = 0;
        let mut failed = 0;
        for batch in submitted {
            if self.confirm_batch(&batch).await? {
                confirmed += 1;
            } else if self.load_batch(batch.id).await?.status == BatchStatus::Failed {
                failed += 1;
            }
        }
        if confirmed + failed > 0 {
            info!(confirmed, failed, "Reconciled submitted ledger batches");
        }
        Ok((confirmed, failed))
    }

    /// Group pending records into batches of the configured size.
    ///
    /// Full groups are always formed; a trailing partial group only once its oldest
    /// member has waited longer than the batch timeout.
    #[instrument(skip(self), fields(org = %self.config.organization_id))]
    pub async fn assemble_pending(&self) -> Result<Vec<LedgerBatch>, AppError> {
        let batch_size = self.config.batch_size.max(1) as usize;
        let pending = self
            .store
            .list_by_status(
                &self.config.organization_id,
                TransactionStatus::Pending,
                batch_size as i64 * MAX_BATCHES_PER_PASS,
            )
            .await?;

        let cutoff = Utc::now() - ChronoDuration::seconds(self.config.batch_timeout_seconds);
        let mut batches = Vec::new();
        for group in pending.chunks(batch_size) {
            let full = group.len() == batch_size;
            let overdue = group.iter().any(|tx| tx.created_at <= cutoff);
            if !full && !overdue {
                debug!(waiting = group.len(), "Holding partial batch");
                continue;
            }
            let ids: Vec<Uuid> = group.iter().map(|tx| tx.id).collect();
            batches.push(self.create_batch(&ids).await?);
        }
        Ok(batches)
    }
}

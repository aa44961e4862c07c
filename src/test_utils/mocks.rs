//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::hash::canonical_json;
use crate::domain::{
    AnchorPayload, AppError, AuditQuery, BatchPayload, BatchStatus, BlockchainError,
    BlockchainNetwork, ChainClient, ChainSubmission, ChainTxStatus, DatabaseError, LedgerBatch,
    LedgerConfiguration, LedgerEvent, LedgerStore, LedgerTransaction, TransactionDetails,
    TransactionStats, TransactionStatus,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Default)]
struct StoreState {
    /// Insertion order doubles as the tie-breaker for equal timestamps
    transactions: Vec<LedgerTransaction>,
    events: Vec<LedgerEvent>,
    batches: HashMap<Uuid, LedgerBatch>,
    configurations: HashMap<String, LedgerConfiguration>,
}

impl StoreState {
    fn tx_mut(&mut self, id: Uuid) -> Option<&mut LedgerTransaction> {
        self.transactions.iter_mut().find(|t| t.id == id)
    }

    fn apply_lifecycle(&mut self, tx: &LedgerTransaction) -> Result<(), AppError> {
        let stored = self
            .tx_mut(tx.id)
            .ok_or_else(|| AppError::Database(DatabaseError::NotFound(tx.id.to_string())))?;
        stored.status = tx.status;
        stored.blockchain_hash = tx.blockchain_hash.clone();
        stored.block_number = tx.block_number;
        stored.transaction_index = tx.transaction_index;
        stored.gas_used = tx.gas_used;
        stored.gas_price = tx.gas_price;
        stored.retry_count = tx.retry_count;
        stored.error_message = tx.error_message.clone();
        stored.next_retry_at = tx.next_retry_at;
        stored.submitted_at = tx.submitted_at;
        stored.confirmed_at = tx.confirmed_at;
        stored.failed_at = tx.failed_at;
        stored.updated_at = tx.updated_at;
        Ok(())
    }
}

/// In-memory ledger store with the same claim and batch-commit semantics as Postgres
pub struct MockLedgerStore {
    state: Arc<Mutex<StoreState>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    /// Remaining injected failures per store operation
    failing_ops: Mutex<HashMap<&'static str, usize>>,
}

impl MockLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            config,
            is_healthy: AtomicBool::new(true),
            failing_ops: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Get all stored transactions (for testing)
    pub fn get_all_transactions(&self) -> Vec<LedgerTransaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    /// Get all stored events (for testing)
    pub fn get_all_events(&self) -> Vec<LedgerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Overwrite a record's data without touching its hash (for tamper tests)
    pub fn overwrite_data(&self, id: Uuid, data: Value) {
        if let Some(tx) = self.state.lock().unwrap().tx_mut(id) {
            tx.transaction_data = data;
        }
    }

    /// Replace a stored record wholesale (for testing)
    pub fn put_transaction(&self, tx: LedgerTransaction) {
        let mut state = self.state.lock().unwrap();
        match state.tx_mut(tx.id) {
            Some(stored) => *stored = tx,
            None => state.transactions.push(tx),
        }
    }

    /// Make the next `times` calls of `operation` (a `LedgerStore` method name) fail
    pub fn fail_operation(&self, operation: &'static str, times: usize) {
        self.failing_ops.lock().unwrap().insert(operation, times);
    }

    fn check_operation(&self, operation: &'static str) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut failing = self.failing_ops.lock().unwrap();
        match failing.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AppError::Database(DatabaseError::Query(format!(
                    "Injected {} failure",
                    operation
                ))))
            }
            _ => Ok(()),
        }
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let msg = self
                .config
                .error_message
                .clone()
                .unwrap_or_else(|| "Mock error".to_string());
            return Err(AppError::Database(DatabaseError::Query(msg)));
        }
        Ok(())
    }
}

impl Default for MockLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MockLedgerStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn insert_transaction(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        if state
            .transactions
            .iter()
            .any(|t| t.source_module == tx.source_module && t.source_id == tx.source_id)
        {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "{}/{}",
                tx.source_module, tx.source_id
            ))));
        }
        state.transactions.push(tx.clone());
        state.events.push(event.clone());
        Ok(())
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<LedgerTransaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_source(
        &self,
        source_module: &str,
        source_id: &str,
    ) -> Result<Option<LedgerTransaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .find(|t| t.source_module == source_module && t.source_id == source_id)
            .cloned())
    }

    async fn get_transactions(&self, ids: &[Uuid]) -> Result<Vec<LedgerTransaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| ids.contains(&t.id))
            .cloned()
            .collect())
    }

    async fn claim_for_submission(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
    ) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        match state.tx_mut(id) {
            Some(tx) if from.contains(&tx.status) => {
                tx.status = TransactionStatus::Submitting;
                tx.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(
        &self,
        id: Uuid,
        to: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        self.check_operation("release_claim")?;
        let mut state = self.state.lock().unwrap();
        match state.tx_mut(id) {
            Some(tx) if tx.status == TransactionStatus::Submitting => {
                tx.status = to;
                if let Some(msg) = error_message {
                    tx.error_message = Some(msg.to_string());
                }
                tx.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_submission(&self, id: Uuid, blockchain_hash: &str) -> Result<bool, AppError> {
        self.check_operation("record_submission")?;
        let mut state = self.state.lock().unwrap();
        match state.tx_mut(id) {
            Some(tx) if tx.status == TransactionStatus::Submitting => {
                let now = Utc::now();
                tx.status = TransactionStatus::Submitted;
                tx.blockchain_hash = Some(blockchain_hash.to_string());
                tx.submitted_at = Some(now);
                tx.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_stale_claims(
        &self,
        organization_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let mut released = 0;
        for tx in state.transactions.iter_mut().filter(|t| {
            t.organization_id == organization_id
                && t.status == TransactionStatus::Submitting
                && t.updated_at < older_than
        }) {
            tx.status = TransactionStatus::Pending;
            tx.updated_at = Utc::now();
            released += 1;
        }
        Ok(released)
    }

    async fn save_transition(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError> {
        self.check_operation("save_transition")?;
        let mut state = self.state.lock().unwrap();
        state.apply_lifecycle(tx)?;
        state.events.push(event.clone());
        Ok(())
    }

    async fn list_by_status(
        &self,
        organization_id: &str,
        status: TransactionStatus,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut items: Vec<LedgerTransaction> = state
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id && t.status == status)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn list_retryable(
        &self,
        organization_id: &str,
        due_at: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut items: Vec<LedgerTransaction> = state
            .transactions
            .iter()
            .filter(|t| {
                t.organization_id == organization_id
                    && t.can_retry()
                    && match (due_at, t.next_retry_at) {
                        (Some(due), Some(next)) => next <= due,
                        _ => true,
                    }
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn query_transactions(
        &self,
        organization_id: &str,
        query: &AuditQuery,
    ) -> Result<(Vec<LedgerTransaction>, i64), AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut matches: Vec<(usize, &LedgerTransaction)> = state
            .transactions
            .iter()
            .enumerate()
            .filter(|(_, t)| t.organization_id == organization_id && query.matches(t))
            .collect();
        matches.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        let total = matches.len() as i64;
        let page = matches
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .map(|(_, t)| t.clone())
            .collect();
        Ok((page, total))
    }

    async fn transaction_stats(&self, organization_id: &str) -> Result<TransactionStats, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut stats = TransactionStats::empty();
        let mut confirmation_secs = Vec::new();
        for tx in state
            .transactions
            .iter()
            .filter(|t| t.organization_id == organization_id)
        {
            stats.total += 1;
            match tx.status {
                TransactionStatus::Pending => stats.pending += 1,
                TransactionStatus::Submitting => stats.submitting += 1,
                TransactionStatus::Submitted => stats.submitted += 1,
                TransactionStatus::Confirmed => stats.confirmed += 1,
                TransactionStatus::Failed => stats.failed += 1,
            }
            stats.total_gas_used += tx.gas_used.unwrap_or(0);
            if let (TransactionStatus::Confirmed, Some(confirmed_at)) = (tx.status, tx.confirmed_at)
            {
                let delta = confirmed_at - tx.created_at;
                confirmation_secs.push(delta.num_milliseconds() as f64 / 1000.0);
            }
        }
        if !confirmation_secs.is_empty() {
            stats.average_confirmation_time =
                Some(confirmation_secs.iter().sum::<f64>() / confirmation_secs.len() as f64);
        }
        Ok(stats)
    }

    async fn insert_event(&self, event: &LedgerEvent) -> Result<(), AppError> {
        self.check_operation("insert_event")?;
        self.state.lock().unwrap().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, transaction_id: Uuid) -> Result<Vec<LedgerEvent>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn insert_batch(&self, batch: &LedgerBatch) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.state
            .lock()
            .unwrap()
            .batches
            .insert(batch.id, batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<LedgerBatch>, AppError> {
        self.check_should_fail()?;
        Ok(self.state.lock().unwrap().batches.get(&id).cloned())
    }

    async fn list_batches_by_status(
        &self,
        organization_id: &str,
        status: BatchStatus,
        limit: i64,
    ) -> Result<Vec<LedgerBatch>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut batches: Vec<LedgerBatch> = state
            .batches
            .values()
            .filter(|b| b.organization_id == organization_id && b.status == status)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        batches.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(batches)
    }

    async fn update_batch(&self, batch: &LedgerBatch) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        match state.batches.get_mut(&batch.id) {
            Some(stored) => {
                *stored = batch.clone();
                Ok(())
            }
            None => Err(AppError::Database(DatabaseError::NotFound(
                batch.id.to_string(),
            ))),
        }
    }

    async fn commit_batch(
        &self,
        batch: &LedgerBatch,
        members: &[LedgerTransaction],
        events: &[LedgerEvent],
    ) -> Result<(), AppError> {
        self.check_operation("commit_batch")?;
        let mut state = self.state.lock().unwrap();
        if !state.batches.contains_key(&batch.id)
            || members
                .iter()
                .any(|m| !state.transactions.iter().any(|t| t.id == m.id))
        {
            return Err(AppError::Database(DatabaseError::NotFound(
                batch.id.to_string(),
            )));
        }
        state.batches.insert(batch.id, batch.clone());
        for tx in members {
            state.apply_lifecycle(tx)?;
        }
        state.events.extend(events.iter().cloned());
        Ok(())
    }

    async fn get_configuration(
        &self,
        organization_id: &str,
    ) -> Result<Option<LedgerConfiguration>, AppError> {
        self.check_should_fail()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .configurations
            .get(organization_id)
            .cloned())
    }

    async fn upsert_configuration(&self, config: &LedgerConfiguration) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.state
            .lock()
            .unwrap()
            .configurations
            .insert(config.organization_id.clone(), config.clone());
        Ok(())
    }

    async fn list_active_configurations(&self) -> Result<Vec<LedgerConfiguration>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut configs: Vec<LedgerConfiguration> = state
            .configurations
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.organization_id.cmp(&b.organization_id));
        Ok(configs)
    }
}

/// Mock chain client for testing
pub struct MockChainClient {
    network: BlockchainNetwork,
    submissions: Arc<Mutex<Vec<AnchorPayload>>>,
    batches: Arc<Mutex<Vec<BatchPayload>>>,
    details: Arc<Mutex<HashMap<String, TransactionDetails>>>,
    failure: Mutex<Option<BlockchainError>>,
    submit_status: Mutex<ChainTxStatus>,
    chain_status: Mutex<ChainTxStatus>,
    delay: Mutex<Option<Duration>>,
    submit_calls: AtomicUsize,
    is_healthy: AtomicBool,
}

impl MockChainClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        let failure = config.should_fail.then(|| {
            BlockchainError::TransactionFailed(
                config
                    .error_message
                    .unwrap_or_else(|| "Mock error".to_string()),
            )
        });
        Self {
            network: BlockchainNetwork::Substrate,
            submissions: Arc::new(Mutex::new(Vec::new())),
            batches: Arc::new(Mutex::new(Vec::new())),
            details: Arc::new(Mutex::new(HashMap::new())),
            failure: Mutex::new(failure),
            submit_status: Mutex::new(ChainTxStatus::Submitted),
            chain_status: Mutex::new(ChainTxStatus::Confirmed),
            delay: Mutex::new(None),
            submit_calls: AtomicUsize::new(0),
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Delay every submission, e.g. to exercise timeouts or overlapping callers
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make every chain call fail with `error` until [`Self::recover`] is called
    pub fn fail_with(&self, error: BlockchainError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Status reported by the submit call itself
    pub fn set_submit_status(&self, status: ChainTxStatus) {
        *self.submit_status.lock().unwrap() = status;
    }

    /// Status later reported for submitted hashes by `get_transaction_details`
    pub fn set_chain_status(&self, status: ChainTxStatus) {
        *self.chain_status.lock().unwrap() = status;
        for details in self.details.lock().unwrap().values_mut() {
            details.status = status;
        }
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn get_submissions(&self) -> Vec<AnchorPayload> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn get_batches(&self) -> Vec<BatchPayload> {
        self.batches.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        match self.failure.lock().unwrap().clone() {
            Some(error) => Err(AppError::Blockchain(error)),
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self) -> ChainSubmission {
        let mut details = self.details.lock().unwrap();
        let index = details.len() as u64;
        let hash = format!("0x{:064x}", index + 1);
        let chain_status = *self.chain_status.lock().unwrap();
        details.insert(
            hash.clone(),
            TransactionDetails {
                hash: hash.clone(),
                block_number: Some(12345 + index),
                transaction_index: Some(0),
                gas_used: Some(21_000),
                gas_price: Some(20_000_000_000),
                status: chain_status,
            },
        );
        ChainSubmission {
            hash,
            status: *self.submit_status.lock().unwrap(),
        }
    }
}

impl Default for MockChainClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn network(&self) -> BlockchainNetwork {
        self.network
    }

    async fn is_connected(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed) && self.check_should_fail().is_ok()
    }

    async fn submit_transaction(
        &self,
        payload: &AnchorPayload,
    ) -> Result<ChainSubmission, AppError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_should_fail()?;
        self.submissions.lock().unwrap().push(payload.clone());
        Ok(self.record())
    }

    async fn submit_batch(&self, payload: &BatchPayload) -> Result<ChainSubmission, AppError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check_should_fail()?;
        self.batches.lock().unwrap().push(payload.clone());
        Ok(self.record())
    }

    async fn verify_transaction(&self, chain_tx_id: &str) -> Result<bool, AppError> {
        self.check_should_fail()?;
        Ok(self
            .details
            .lock()
            .unwrap()
            .get(chain_tx_id)
            .is_some_and(|d| d.status == ChainTxStatus::Confirmed))
    }

    async fn get_transaction_details(
        &self,
        chain_tx_id: &str,
    ) -> Result<Option<TransactionDetails>, AppError> {
        self.check_should_fail()?;
        Ok(self.details.lock().unwrap().get(chain_tx_id).cloned())
    }

    async fn estimate_gas(&self, payload: &AnchorPayload) -> Result<u64, AppError> {
        self.check_should_fail()?;
        let encoded = canonical_json(&serde_json::to_value(payload)?)?;
        Ok(21_000 + encoded.len() as u64 * 16)
    }

    async fn get_current_block_number(&self) -> Result<u64, AppError> {
        self.check_should_fail()?;
        Ok(12345 + self.details.lock().unwrap().len() as u64)
    }
}

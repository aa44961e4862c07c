//! Background anchoring loop for one organization.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::service::TransactionService;
use crate::domain::AppError;

/// Configuration for the background worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Time between passes
    pub poll_interval: Duration,
    /// Records handled per step of a pass
    pub batch_limit: i64,
    /// Claims older than this are considered orphaned
    pub stale_claim_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(10),
            batch_limit: 50,
            stale_claim_after: Duration::from_secs(300),
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub released: u64,
    pub batches_submitted: usize,
    pub batches_confirmed: usize,
    pub batches_failed: usize,
    pub submitted: usize,
    pub retried: usize,
    pub confirmed: usize,
    pub failed: usize,
}

impl WorkerReport {
    fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodically releases stale claims, anchors pending work, retries due failures and
/// reconciles submitted batches and records
pub struct AnchorWorker {
    service: Arc<TransactionService>,
    config: WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl AnchorWorker {
    #[must_use]
    pub fn new(
        service: Arc<TransactionService>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            config,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let org = self.service.organization_id().to_string();
        if !self.config.enabled {
            info!(org = %org, "Anchor worker disabled");
            return;
        }
        info!(
            org = %org,
            poll_interval = ?self.config.poll_interval,
            "Anchor worker started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_idle() => debug!(org = %org, "Nothing to anchor"),
                        Ok(report) => info!(org = %org, ?report, "Anchor pass finished"),
                        Err(e) => error!(org = %org, error = ?e, "Anchor pass failed"),
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(org = %org, "Anchor worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full pass
    #[instrument(skip(self), fields(org = %self.service.organization_id()))]
    pub async fn run_once(&self) -> Result<WorkerReport, AppError> {
        let org = self.service.organization_id();
        let limit = self.config.batch_limit;
        let mut report = WorkerReport {
            released: self
                .service
                .release_stale_claims(org, self.config.stale_claim_after)
                .await?,
            ..WorkerReport::default()
        };

        if self.service.configuration().batch_size > 1 {
            for batch in self.service.batches().assemble_pending().await? {
                match self.service.submit_batch(&batch).await {
                    Ok(true) => report.batches_submitted += 1,
                    Ok(false) => {}
                    Err(e) => error!(batch_id = %batch.id, error = ?e, "Batch submission errored"),
                }
            }
        } else {
            let (submitted, failed) = self.service.submit_pending(org, limit).await?;
            report.submitted = submitted;
            report.failed += failed;
        }

        let (retried, failed) = self.service.retry_due_transactions(org, limit).await?;
        report.retried = retried;
        report.failed += failed;

        let (confirmed, failed) = self.service.batches().reconcile_submitted(limit).await?;
        report.batches_confirmed = confirmed;
        report.batches_failed = failed;

        let (confirmed, failed) = self.service.reconcile_submitted(org, limit).await?;
        report.confirmed = confirmed;
        report.failed += failed;

        Ok(report)
    }
}

/// Spawn the worker, returning its handle and the shutdown switch
pub fn spawn_worker(
    service: Arc<TransactionService>,
    config: WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = AnchorWorker::new(service, config, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ServiceSettings;
    use crate::domain::{
        BatchStatus, BlockchainError, BlockchainNetwork, ChainTxStatus, LedgerConfiguration,
        LedgerStore, NewLedgerTransaction, TransactionStatus,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use crate::test_utils::{MockChainClient, MockLedgerStore};
    use serde_json::json;

    fn service(
        store: Arc<MockLedgerStore>,
        chain: Arc<MockChainClient>,
        batch_size: i32,
    ) -> Arc<TransactionService> {
        let mut config = LedgerConfiguration::new("org-1", BlockchainNetwork::Substrate);
        config.batch_size = batch_size;
        config.auto_confirm = false;
        Arc::new(TransactionService::new(
            store,
            chain,
            config,
            ServiceSettings::default(),
        ))
    }

    fn new_tx(source_id: &str) -> NewLedgerTransaction {
        NewLedgerTransaction::new(
            "invoice",
            "finance",
            source_id,
            json!({"amount": 10, "currency": "USD", "description": "x"}),
            Some("org-1".to_string()),
        )
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.batch_limit, 50);
    }

    #[tokio::test]
    async fn test_run_once_submits_pending_individually() {
        let store = Arc::new(MockLedgerStore::new());
        let chain = Arc::new(MockChainClient::new());
        let service = service(Arc::clone(&store), Arc::clone(&chain), 1);
        service.create_transaction(&new_tx("INV-1")).await.unwrap();
        service.create_transaction(&new_tx("INV-2")).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker = AnchorWorker::new(service, WorkerConfig::default(), rx);
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.submitted, 2);
        assert_eq!(chain.submit_calls(), 2);
        // Reconcile in the same pass confirms what the chain reports as final
        assert_eq!(report.confirmed, 2);
    }

    #[tokio::test]
    async fn test_run_once_batches_full_groups() {
        let store = Arc::new(MockLedgerStore::new());
        let chain = Arc::new(MockChainClient::new());
        let service = service(Arc::clone(&store), Arc::clone(&chain), 2);
        for i in 0..3 {
            service
                .create_transaction(&new_tx(&format!("INV-{i}")))
                .await
                .unwrap();
        }

        let (_tx, rx) = watch::channel(false);
        let worker = AnchorWorker::new(service, WorkerConfig::default(), rx);
        let report = worker.run_once().await.unwrap();

        // Third record waits for its partial batch to time out
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(chain.get_batches().len(), 1);
        let pending = store
            .list_by_status("org-1", TransactionStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batches_charge_members_until_exhausted() {
        let store = Arc::new(MockLedgerStore::new());
        let chain = Arc::new(MockChainClient::new());
        let service = service(Arc::clone(&store), Arc::clone(&chain), 2);
        service.create_transaction(&new_tx("INV-1")).await.unwrap();
        service.create_transaction(&new_tx("INV-2")).await.unwrap();
        chain.fail_with(BlockchainError::Connection("node down".into()));

        let (_tx, rx) = watch::channel(false);
        let worker = AnchorWorker::new(service, WorkerConfig::default(), rx);
        for _ in 0..6 {
            worker.run_once().await.unwrap();
        }

        // One batch attempt; later passes wait for the members' backoff
        assert_eq!(chain.submit_calls(), 1);
        let records = store.get_all_transactions();
        for tx in &records {
            assert_eq!(tx.status, TransactionStatus::Failed);
            assert_eq!(tx.retry_count, 1);
            assert!(tx.next_retry_at.is_some());
        }

        // Once due, members retry on their own budget and stop when it runs out
        for _ in 0..5 {
            for tx in store.get_all_transactions() {
                let mut due = tx.clone();
                due.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(1));
                store.put_transaction(due);
            }
            worker.run_once().await.unwrap();
        }
        for tx in store.get_all_transactions() {
            assert_eq!(tx.status, TransactionStatus::Failed);
            assert_eq!(tx.retry_count, tx.max_retries);
            assert!(!tx.can_retry());
        }
        // Two single retries per member after the batch attempt
        assert!(chain.get_batches().is_empty());
        assert_eq!(chain.submit_calls(), 5);
    }

    #[tokio::test]
    async fn test_run_once_confirms_submitted_batches() {
        let store = Arc::new(MockLedgerStore::new());
        let chain = Arc::new(MockChainClient::new());
        chain.set_chain_status(ChainTxStatus::Pending);
        let service = service(Arc::clone(&store), Arc::clone(&chain), 2);
        service.create_transaction(&new_tx("INV-1")).await.unwrap();
        service.create_transaction(&new_tx("INV-2")).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker = AnchorWorker::new(Arc::clone(&service), WorkerConfig::default(), rx);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.batches_submitted, 1);
        assert_eq!(report.batches_confirmed, 0);

        let submitted = store
            .list_batches_by_status("org-1", BatchStatus::Submitted, 10)
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1);

        chain.set_chain_status(ChainTxStatus::Confirmed);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.batches_confirmed, 1);

        let batch = store.get_batch(submitted[0].id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Confirmed);
        for tx in store.get_all_transactions() {
            assert_eq!(tx.status, TransactionStatus::Confirmed);
        }
    }

    #[tokio::test]
    async fn test_spawned_worker_stops_on_shutdown() {
        let store = Arc::new(MockLedgerStore::new());
        let chain = Arc::new(MockChainClient::new());
        let config = WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        let (handle, shutdown_tx) = spawn_worker(service(store, chain, 1), config);

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

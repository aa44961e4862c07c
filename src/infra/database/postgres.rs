//! PostgreSQL ledger store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, AuditQuery, BatchStatus, DatabaseError, LedgerBatch, LedgerConfiguration,
    LedgerEvent, LedgerStore, LedgerTransaction, TransactionStats, TransactionStatus,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

const TX_COLUMNS: &str = "id, transaction_type, source_module, source_id, transaction_data, \
    hash, status, blockchain_hash, block_number, transaction_index, gas_used, gas_price, \
    retry_count, max_retries, error_message, next_retry_at, organization_id, created_by_id, \
    created_at, submitted_at, confirmed_at, failed_at, updated_at";

const CONFIG_COLUMNS: &str = "organization_id, blockchain_network, rpc_endpoint, \
    contract_address, sender_address, batch_size, batch_timeout_seconds, retry_attempts, \
    gas_limit, gas_price, auto_confirm, is_active";

fn query_error(e: sqlx::Error) -> AppError {
    AppError::Database(DatabaseError::Query(e.to_string()))
}

fn corrupt(column: &str, value: &str) -> AppError {
    AppError::Database(DatabaseError::Query(format!(
        "Unexpected {} value in database: {}",
        column, value
    )))
}

/// Ledger store backed by a PostgreSQL connection pool
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Create a new store with custom pool configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new store with default pool configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_transaction(row: &PgRow) -> Result<LedgerTransaction, AppError> {
        let status: String = row.try_get("status").map_err(query_error)?;
        Ok(LedgerTransaction {
            id: row.try_get("id").map_err(query_error)?,
            transaction_type: row.try_get("transaction_type").map_err(query_error)?,
            source_module: row.try_get("source_module").map_err(query_error)?,
            source_id: row.try_get("source_id").map_err(query_error)?,
            transaction_data: row.try_get("transaction_data").map_err(query_error)?,
            hash: row.try_get("hash").map_err(query_error)?,
            status: status.parse().map_err(|_| corrupt("status", &status))?,
            blockchain_hash: row.try_get("blockchain_hash").map_err(query_error)?,
            block_number: row.try_get("block_number").map_err(query_error)?,
            transaction_index: row.try_get("transaction_index").map_err(query_error)?,
            gas_used: row.try_get("gas_used").map_err(query_error)?,
            gas_price: row.try_get("gas_price").map_err(query_error)?,
            retry_count: row.try_get("retry_count").map_err(query_error)?,
            max_retries: row.try_get("max_retries").map_err(query_error)?,
            error_message: row.try_get("error_message").map_err(query_error)?,
            next_retry_at: row.try_get("next_retry_at").map_err(query_error)?,
            organization_id: row.try_get("organization_id").map_err(query_error)?,
            created_by_id: row.try_get("created_by_id").map_err(query_error)?,
            created_at: row.try_get("created_at").map_err(query_error)?,
            submitted_at: row.try_get("submitted_at").map_err(query_error)?,
            confirmed_at: row.try_get("confirmed_at").map_err(query_error)?,
            failed_at: row.try_get("failed_at").map_err(query_error)?,
            updated_at: row.try_get("updated_at").map_err(query_error)?,
        })
    }

    fn row_to_event(row: &PgRow) -> Result<LedgerEvent, AppError> {
        let event_type: String = row.try_get("event_type").map_err(query_error)?;
        Ok(LedgerEvent {
            id: row.try_get("id").map_err(query_error)?,
            transaction_id: row.try_get("transaction_id").map_err(query_error)?,
            event_type: event_type
                .parse()
                .map_err(|_| corrupt("event_type", &event_type))?,
            event_data: row.try_get("event_data").map_err(query_error)?,
            blockchain_event_id: row.try_get("blockchain_event_id").map_err(query_error)?,
            created_at: row.try_get("created_at").map_err(query_error)?,
        })
    }

    fn row_to_batch(row: &PgRow, transaction_ids: Vec<Uuid>) -> Result<LedgerBatch, AppError> {
        let status: String = row.try_get("status").map_err(query_error)?;
        Ok(LedgerBatch {
            id: row.try_get("id").map_err(query_error)?,
            batch_hash: row.try_get("batch_hash").map_err(query_error)?,
            transaction_ids,
            status: status
                .parse::<BatchStatus>()
                .map_err(|_| corrupt("batch status", &status))?,
            blockchain_hash: row.try_get("blockchain_hash").map_err(query_error)?,
            block_number: row.try_get("block_number").map_err(query_error)?,
            gas_used: row.try_get("gas_used").map_err(query_error)?,
            error_message: row.try_get("error_message").map_err(query_error)?,
            organization_id: row.try_get("organization_id").map_err(query_error)?,
            created_at: row.try_get("created_at").map_err(query_error)?,
            submitted_at: row.try_get("submitted_at").map_err(query_error)?,
            confirmed_at: row.try_get("confirmed_at").map_err(query_error)?,
            failed_at: row.try_get("failed_at").map_err(query_error)?,
        })
    }

    fn row_to_configuration(row: &PgRow) -> Result<LedgerConfiguration, AppError> {
        let network: String = row.try_get("blockchain_network").map_err(query_error)?;
        Ok(LedgerConfiguration {
            organization_id: row.try_get("organization_id").map_err(query_error)?,
            blockchain_network: network
                .parse()
                .map_err(|_| corrupt("blockchain_network", &network))?,
            rpc_endpoint: row.try_get("rpc_endpoint").map_err(query_error)?,
            contract_address: row.try_get("contract_address").map_err(query_error)?,
            sender_address: row.try_get("sender_address").map_err(query_error)?,
            batch_size: row.try_get("batch_size").map_err(query_error)?,
            batch_timeout_seconds: row.try_get("batch_timeout_seconds").map_err(query_error)?,
            retry_attempts: row.try_get("retry_attempts").map_err(query_error)?,
            gas_limit: row.try_get("gas_limit").map_err(query_error)?,
            gas_price: row.try_get("gas_price").map_err(query_error)?,
            auto_confirm: row.try_get("auto_confirm").map_err(query_error)?,
            is_active: row.try_get("is_active").map_err(query_error)?,
        })
    }

    /// Write the mutable lifecycle columns of a record
    async fn write_lifecycle<'e, E: PgExecutor<'e>>(
        executor: E,
        tx: &LedgerTransaction,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = $2,
                blockchain_hash = $3,
                block_number = $4,
                transaction_index = $5,
                gas_used = $6,
                gas_price = $7,
                retry_count = $8,
                error_message = $9,
                next_retry_at = $10,
                submitted_at = $11,
                confirmed_at = $12,
                failed_at = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(tx.id)
        .bind(tx.status.as_str())
        .bind(&tx.blockchain_hash)
        .bind(tx.block_number)
        .bind(tx.transaction_index)
        .bind(tx.gas_used)
        .bind(tx.gas_price)
        .bind(tx.retry_count)
        .bind(&tx.error_message)
        .bind(tx.next_retry_at)
        .bind(tx.submitted_at)
        .bind(tx.confirmed_at)
        .bind(tx.failed_at)
        .bind(tx.updated_at)
        .execute(executor)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Database(DatabaseError::NotFound(format!(
                "ledger transaction {}",
                tx.id
            ))));
        }
        Ok(())
    }

    async fn write_event<'e, E: PgExecutor<'e>>(
        executor: E,
        event: &LedgerEvent,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_events (id, transaction_id, event_type, event_data,
                                       blockchain_event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.transaction_id)
        .bind(event.event_type.as_str())
        .bind(&event.event_data)
        .bind(&event.blockchain_event_id)
        .bind(event.created_at)
        .execute(executor)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn write_batch<'e, E: PgExecutor<'e>>(
        executor: E,
        batch: &LedgerBatch,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE ledger_batches
            SET status = $2,
                blockchain_hash = $3,
                block_number = $4,
                gas_used = $5,
                error_message = $6,
                submitted_at = $7,
                confirmed_at = $8,
                failed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(batch.id)
        .bind(batch.status.as_str())
        .bind(&batch.blockchain_hash)
        .bind(batch.block_number)
        .bind(batch.gas_used)
        .bind(&batch.error_message)
        .bind(batch.submitted_at)
        .bind(batch.confirmed_at)
        .bind(batch.failed_at)
        .execute(executor)
        .await
        .map_err(query_error)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, tx, event), fields(id = %tx.id, source = %tx.source_id))]
    async fn insert_transaction(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                id, transaction_type, source_module, source_id, transaction_data, hash,
                status, retry_count, max_retries, organization_id, created_by_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(tx.id)
        .bind(&tx.transaction_type)
        .bind(&tx.source_module)
        .bind(&tx.source_id)
        .bind(&tx.transaction_data)
        .bind(&tx.hash)
        .bind(tx.status.as_str())
        .bind(tx.retry_count)
        .bind(tx.max_retries)
        .bind(&tx.organization_id)
        .bind(&tx.created_by_id)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Self::write_event(&mut *db_tx, event).await?;
        db_tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_transaction(&self, id: Uuid) -> Result<Option<LedgerTransaction>, AppError> {
        let sql = format!("SELECT {TX_COLUMNS} FROM ledger_transactions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_source(
        &self,
        source_module: &str,
        source_id: &str,
    ) -> Result<Option<LedgerTransaction>, AppError> {
        let sql = format!(
            "SELECT {TX_COLUMNS} FROM ledger_transactions WHERE source_module = $1 AND source_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(source_module)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn get_transactions(&self, ids: &[Uuid]) -> Result<Vec<LedgerTransaction>, AppError> {
        let sql = format!("SELECT {TX_COLUMNS} FROM ledger_transactions WHERE id = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self))]
    async fn claim_for_submission(
        &self,
        id: Uuid,
        from: &[TransactionStatus],
    ) -> Result<bool, AppError> {
        let from: Vec<&str> = from.iter().map(TransactionStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'submitting', updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&from)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_claim(
        &self,
        id: Uuid,
        to: TransactionStatus,
        error_message: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = $2,
                error_message = COALESCE($3, error_message),
                updated_at = NOW()
            WHERE id = $1 AND status = 'submitting'
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn record_submission(&self, id: Uuid, blockchain_hash: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'submitted',
                blockchain_hash = $2,
                submitted_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'submitting'
            "#,
        )
        .bind(id)
        .bind(blockchain_hash)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_stale_claims(
        &self,
        organization_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = 'pending', updated_at = NOW()
            WHERE organization_id = $1 AND status = 'submitting' AND updated_at < $2
            "#,
        )
        .bind(organization_id)
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, tx, event), fields(id = %tx.id, status = %tx.status, event = event.event_type.as_str()))]
    async fn save_transition(
        &self,
        tx: &LedgerTransaction,
        event: &LedgerEvent,
    ) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await.map_err(query_error)?;
        Self::write_lifecycle(&mut *db_tx, tx).await?;
        Self::write_event(&mut *db_tx, event).await?;
        db_tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_by_status(
        &self,
        organization_id: &str,
        status: TransactionStatus,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM ledger_transactions
            WHERE organization_id = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self))]
    async fn list_retryable(
        &self,
        organization_id: &str,
        due_at: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>, AppError> {
        let sql = format!(
            r#"
            SELECT {TX_COLUMNS} FROM ledger_transactions
            WHERE organization_id = $1
              AND status = 'failed'
              AND retry_count < max_retries
              AND ($2::timestamptz IS NULL OR next_retry_at IS NULL OR next_retry_at <= $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(due_at)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self, query), fields(limit = query.limit, offset = query.offset))]
    async fn query_transactions(
        &self,
        organization_id: &str,
        query: &AuditQuery,
    ) -> Result<(Vec<LedgerTransaction>, i64), AppError> {
        const FILTER: &str = r#"
            WHERE organization_id = $1
              AND ($2::text IS NULL OR transaction_type = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
        "#;
        let status = query.status.map(|s| s.as_str());

        let count_sql = format!("SELECT COUNT(*) AS total FROM ledger_transactions {FILTER}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(organization_id)
            .bind(&query.transaction_type)
            .bind(status)
            .bind(query.start_date)
            .bind(query.end_date)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?
            .try_get("total")
            .map_err(query_error)?;

        let page_sql = format!(
            "SELECT {TX_COLUMNS} FROM ledger_transactions {FILTER} \
             ORDER BY created_at DESC, id DESC LIMIT $6 OFFSET $7"
        );
        let rows = sqlx::query(&page_sql)
            .bind(organization_id)
            .bind(&query.transaction_type)
            .bind(status)
            .bind(query.start_date)
            .bind(query.end_date)
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;

        let transactions = rows
            .iter()
            .map(Self::row_to_transaction)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((transactions, total))
    }

    #[instrument(skip(self))]
    async fn transaction_stats(&self, organization_id: &str) -> Result<TransactionStats, AppError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'submitting') AS submitting,
                   COUNT(*) FILTER (WHERE status = 'submitted') AS submitted,
                   COUNT(*) FILTER (WHERE status = 'confirmed') AS confirmed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COALESCE(SUM(gas_used), 0)::BIGINT AS total_gas_used,
                   (AVG(EXTRACT(EPOCH FROM (confirmed_at - created_at)))
                       FILTER (WHERE status = 'confirmed' AND confirmed_at IS NOT NULL))::FLOAT8
                       AS average_confirmation_time
            FROM ledger_transactions
            WHERE organization_id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(TransactionStats {
            total: row.try_get("total").map_err(query_error)?,
            pending: row.try_get("pending").map_err(query_error)?,
            submitting: row.try_get("submitting").map_err(query_error)?,
            submitted: row.try_get("submitted").map_err(query_error)?,
            confirmed: row.try_get("confirmed").map_err(query_error)?,
            failed: row.try_get("failed").map_err(query_error)?,
            total_gas_used: row.try_get("total_gas_used").map_err(query_error)?,
            average_confirmation_time: row
                .try_get("average_confirmation_time")
                .map_err(query_error)?,
            last_updated: Utc::now(),
        })
    }

    #[instrument(skip(self, event), fields(tx = %event.transaction_id, event = event.event_type.as_str()))]
    async fn insert_event(&self, event: &LedgerEvent) -> Result<(), AppError> {
        Self::write_event(&self.pool, event).await
    }

    #[instrument(skip(self))]
    async fn list_events(&self, transaction_id: Uuid) -> Result<Vec<LedgerEvent>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, event_type, event_data, blockchain_event_id, created_at
            FROM ledger_events
            WHERE transaction_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;
        rows.iter().map(Self::row_to_event).collect()
    }

    #[instrument(skip(self, batch), fields(id = %batch.id, size = batch.transaction_count()))]
    async fn insert_batch(&self, batch: &LedgerBatch) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await.map_err(query_error)?;

        sqlx::query(
            r#"
            INSERT INTO ledger_batches (id, batch_hash, status, organization_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.batch_hash)
        .bind(batch.status.as_str())
        .bind(&batch.organization_id)
        .bind(batch.created_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        for (position, transaction_id) in batch.transaction_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO ledger_batch_members (batch_id, transaction_id, position)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(batch.id)
            .bind(transaction_id)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *db_tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;
        }

        db_tx.commit().await.map_err(query_error)?;
        debug!("Batch persisted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_batch(&self, id: Uuid) -> Result<Option<LedgerBatch>, AppError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, batch_hash, status, blockchain_hash, block_number, gas_used,
                   error_message, organization_id, created_at, submitted_at,
                   confirmed_at, failed_at
            FROM ledger_batches
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?
        else {
            return Ok(None);
        };

        let member_rows = sqlx::query(
            "SELECT transaction_id FROM ledger_batch_members WHERE batch_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;
        let members = member_rows
            .iter()
            .map(|r| r.try_get("transaction_id").map_err(query_error))
            .collect::<Result<Vec<Uuid>, _>>()?;

        Self::row_to_batch(&row, members).map(Some)
    }

    #[instrument(skip(self))]
    async fn list_batches_by_status(
        &self,
        organization_id: &str,
        status: BatchStatus,
        limit: i64,
    ) -> Result<Vec<LedgerBatch>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, batch_hash, status, blockchain_hash, block_number, gas_used,
                   error_message, organization_id, created_at, submitted_at,
                   confirmed_at, failed_at
            FROM ledger_batches
            WHERE organization_id = $1 AND status = $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(organization_id)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids = rows
            .iter()
            .map(|r| r.try_get("id").map_err(query_error))
            .collect::<Result<Vec<Uuid>, _>>()?;
        let member_rows = sqlx::query(
            r#"
            SELECT batch_id, transaction_id
            FROM ledger_batch_members
            WHERE batch_id = ANY($1)
            ORDER BY batch_id, position
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        let mut members: HashMap<Uuid, Vec<Uuid>> = HashMap::with_capacity(ids.len());
        for row in &member_rows {
            let batch_id: Uuid = row.try_get("batch_id").map_err(query_error)?;
            let transaction_id: Uuid = row.try_get("transaction_id").map_err(query_error)?;
            members.entry(batch_id).or_default().push(transaction_id);
        }

        rows.iter()
            .zip(ids)
            .map(|(row, id)| Self::row_to_batch(row, members.remove(&id).unwrap_or_default()))
            .collect()
    }

    #[instrument(skip(self, batch), fields(id = %batch.id, status = %batch.status))]
    async fn update_batch(&self, batch: &LedgerBatch) -> Result<(), AppError> {
        Self::write_batch(&self.pool, batch).await
    }

    #[instrument(skip(self, batch, members, events), fields(id = %batch.id, status = %batch.status, members = members.len()))]
    async fn commit_batch(
        &self,
        batch: &LedgerBatch,
        members: &[LedgerTransaction],
        events: &[LedgerEvent],
    ) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await.map_err(query_error)?;
        Self::write_batch(&mut *db_tx, batch).await?;
        for tx in members {
            Self::write_lifecycle(&mut *db_tx, tx).await?;
        }
        for event in events {
            Self::write_event(&mut *db_tx, event).await?;
        }
        db_tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_configuration(
        &self,
        organization_id: &str,
    ) -> Result<Option<LedgerConfiguration>, AppError> {
        let sql =
            format!("SELECT {CONFIG_COLUMNS} FROM ledger_configurations WHERE organization_id = $1");
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(Self::row_to_configuration).transpose()
    }

    #[instrument(skip(self, config), fields(org = %config.organization_id, network = %config.blockchain_network))]
    async fn upsert_configuration(&self, config: &LedgerConfiguration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ledger_configurations (
                organization_id, blockchain_network, rpc_endpoint, contract_address,
                sender_address, batch_size, batch_timeout_seconds, retry_attempts,
                gas_limit, gas_price, auto_confirm, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW())
            ON CONFLICT (organization_id) DO UPDATE SET
                blockchain_network = EXCLUDED.blockchain_network,
                rpc_endpoint = EXCLUDED.rpc_endpoint,
                contract_address = EXCLUDED.contract_address,
                sender_address = EXCLUDED.sender_address,
                batch_size = EXCLUDED.batch_size,
                batch_timeout_seconds = EXCLUDED.batch_timeout_seconds,
                retry_attempts = EXCLUDED.retry_attempts,
                gas_limit = EXCLUDED.gas_limit,
                gas_price = EXCLUDED.gas_price,
                auto_confirm = EXCLUDED.auto_confirm,
                is_active = EXCLUDED.is_active,
                updated_at = NOW()
            "#,
        )
        .bind(&config.organization_id)
        .bind(config.blockchain_network.as_str())
        .bind(&config.rpc_endpoint)
        .bind(&config.contract_address)
        .bind(&config.sender_address)
        .bind(config.batch_size)
        .bind(config.batch_timeout_seconds)
        .bind(config.retry_attempts)
        .bind(config.gas_limit)
        .bind(config.gas_price)
        .bind(config.auto_confirm)
        .bind(config.is_active)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_active_configurations(&self) -> Result<Vec<LedgerConfiguration>, AppError> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM ledger_configurations WHERE is_active ORDER BY organization_id"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(Self::row_to_configuration).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_column_lists_cover_every_field() {
        assert_eq!(TX_COLUMNS.split(',').count(), 23);
        assert_eq!(CONFIG_COLUMNS.split(',').count(), 12);
    }
}

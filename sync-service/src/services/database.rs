//! PostgreSQL ledger store for sync-service.

use crate::error::StoreError;
use crate::models::{
    ApplyResult, MutationRecord, MutationStatus, PeriodSummary, RollupBucket, RollupField,
    SourceItem, TransactionSnapshot, TxnType,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{LedgerStore, WriteBatch, WriteOp};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(FromRow)]
struct SnapshotRow {
    principal_id: Uuid,
    id: String,
    source_item_id: String,
    date: NaiveDate,
    txn_type: String,
    amount: Decimal,
    category: String,
    pending: bool,
    currency: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for TransactionSnapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let txn_type = TxnType::parse(&row.txn_type).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("unknown txn_type '{}'", row.txn_type))
        })?;
        Ok(Self {
            id: row.id,
            principal_id: row.principal_id,
            source_item_id: row.source_item_id,
            date: row.date,
            txn_type,
            amount: row.amount,
            category: row.category,
            pending: row.pending,
            currency: row.currency,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SourceItemRow {
    principal_id: Uuid,
    item_id: String,
    access_token: String,
    cursor: Option<String>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl From<SourceItemRow> for SourceItem {
    fn from(row: SourceItemRow) -> Self {
        Self {
            item_id: row.item_id,
            principal_id: row.principal_id,
            access_token: row.access_token,
            cursor: row.cursor,
            last_synced_at: row.last_synced_at,
        }
    }
}

#[derive(FromRow)]
struct MutationRow {
    principal_id: Uuid,
    mutation_id: String,
    status: String,
    created_at: DateTime<Utc>,
    applied_at: Option<DateTime<Utc>>,
    error: Option<String>,
    result: Option<Json<ApplyResult>>,
}

impl TryFrom<MutationRow> for MutationRecord {
    type Error = StoreError;

    fn try_from(row: MutationRow) -> Result<Self, Self::Error> {
        let status = MutationStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("unknown mutation status '{}'", row.status))
        })?;
        Ok(Self {
            principal_id: row.principal_id,
            mutation_id: row.mutation_id,
            status,
            created_at: row.created_at,
            applied_at: row.applied_at,
            error: row.error,
            result: row.result.map(|Json(r)| r),
        })
    }
}

#[derive(FromRow)]
struct BucketRow {
    principal_id: Uuid,
    period_key: String,
    category_id: String,
    category: String,
    expense_total: Decimal,
    income_total: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<BucketRow> for RollupBucket {
    fn from(row: BucketRow) -> Self {
        Self {
            principal_id: row.principal_id,
            period_key: row.period_key,
            category_id: row.category_id,
            category: row.category,
            expense_total: row.expense_total,
            income_total: row.income_total,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct SummaryRow {
    principal_id: Uuid,
    period_key: String,
    expense_total: Decimal,
    income_total: Decimal,
    net: Decimal,
    updated_at: DateTime<Utc>,
}

impl From<SummaryRow> for PeriodSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            principal_id: row.principal_id,
            period_key: row.period_key,
            expense_total: row.expense_total,
            income_total: row.income_total,
            net: row.net,
            updated_at: row.updated_at,
        }
    }
}

/// Split a signed increment into (expense, income) columns.
fn split(field: RollupField, amount: Decimal) -> (Decimal, Decimal) {
    match field {
        RollupField::ExpenseTotal => (amount, Decimal::ZERO),
        RollupField::IncomeTotal => (Decimal::ZERO, amount),
    }
}

const SNAPSHOT_COLUMNS: &str =
    "principal_id, id, source_item_id, date, txn_type, amount, category, pending, currency, updated_at";
const MUTATION_COLUMNS: &str =
    "principal_id, mutation_id, status, created_at, applied_at, error, result";
const BUCKET_COLUMNS: &str =
    "principal_id, period_key, category_id, category, expense_total, income_total, updated_at";

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "sync-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Provisioning
    // -------------------------------------------------------------------------

    /// Register or re-link a source item. The stored cursor is kept on re-link.
    #[instrument(skip(self, item), fields(principal_id = %item.principal_id, item_id = %item.item_id))]
    pub async fn upsert_source_item(&self, item: &SourceItem) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_items (principal_id, item_id, access_token, cursor, last_synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (principal_id, item_id) DO UPDATE SET access_token = EXCLUDED.access_token
            "#,
        )
        .bind(item.principal_id)
        .bind(&item.item_id)
        .bind(&item.access_token)
        .bind(&item.cursor)
        .bind(item.last_synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a transaction as manually edited.
    #[instrument(skip(self), fields(principal_id = %principal_id))]
    pub async fn insert_override(
        &self,
        principal_id: Uuid,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_overrides (principal_id, transaction_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(principal_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Batch operations
    // -------------------------------------------------------------------------

    async fn apply_op(
        tx: &mut Transaction<'_, Postgres>,
        op: &WriteOp,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match op {
            WriteOp::UpsertSnapshot(s) => {
                sqlx::query(
                    r#"
                    INSERT INTO transaction_snapshots (principal_id, id, source_item_id, date, txn_type, amount, category, pending, currency, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (principal_id, id) DO UPDATE SET
                        source_item_id = EXCLUDED.source_item_id,
                        date = EXCLUDED.date,
                        txn_type = EXCLUDED.txn_type,
                        amount = EXCLUDED.amount,
                        category = EXCLUDED.category,
                        pending = EXCLUDED.pending,
                        currency = EXCLUDED.currency,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(s.principal_id)
                .bind(&s.id)
                .bind(&s.source_item_id)
                .bind(s.date)
                .bind(s.txn_type.as_str())
                .bind(s.amount)
                .bind(&s.category)
                .bind(s.pending)
                .bind(&s.currency)
                .bind(s.updated_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::DeleteSnapshot {
                principal_id,
                transaction_id,
            } => {
                sqlx::query("DELETE FROM transaction_snapshots WHERE principal_id = $1 AND id = $2")
                    .bind(principal_id)
                    .bind(transaction_id)
                    .execute(&mut **tx)
                    .await?;
            }
            WriteOp::SetCursor {
                principal_id,
                item_id,
                cursor,
                synced_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE source_items SET cursor = $3, last_synced_at = $4
                    WHERE principal_id = $1 AND item_id = $2
                    "#,
                )
                .bind(principal_id)
                .bind(item_id)
                .bind(cursor)
                .bind(synced_at)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::IncrementRollup {
                principal_id,
                period_key,
                category_id,
                category,
                field,
                amount,
            } => {
                let (expense, income) = split(*field, *amount);
                sqlx::query(
                    r#"
                    INSERT INTO rollup_buckets (principal_id, period_key, category_id, category, expense_total, income_total, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (principal_id, period_key, category_id) DO UPDATE SET
                        category = EXCLUDED.category,
                        expense_total = rollup_buckets.expense_total + EXCLUDED.expense_total,
                        income_total = rollup_buckets.income_total + EXCLUDED.income_total,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(principal_id)
                .bind(period_key)
                .bind(category_id)
                .bind(category)
                .bind(expense)
                .bind(income)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::IncrementSummary {
                principal_id,
                period_key,
                field,
                amount,
            } => {
                let (expense, income) = split(*field, *amount);
                sqlx::query(
                    r#"
                    INSERT INTO period_summaries (principal_id, period_key, expense_total, income_total, net, updated_at)
                    VALUES ($1, $2, $3, $4, $4 - $3, $5)
                    ON CONFLICT (principal_id, period_key) DO UPDATE SET
                        expense_total = period_summaries.expense_total + EXCLUDED.expense_total,
                        income_total = period_summaries.income_total + EXCLUDED.income_total,
                        net = period_summaries.net + EXCLUDED.net,
                        updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(principal_id)
                .bind(period_key)
                .bind(expense)
                .bind(income)
                .bind(now)
                .execute(&mut **tx)
                .await?;
            }
            WriteOp::ClaimMutation {
                principal_id,
                mutation_id,
                result,
            } => {
                // Row lock on conflict serializes concurrent claims of one id.
                let claimed = sqlx::query(
                    r#"
                    INSERT INTO rollup_mutations (principal_id, mutation_id, status, created_at, applied_at, result)
                    VALUES ($1, $2, 'applied', $3, $3, $4)
                    ON CONFLICT (principal_id, mutation_id) DO UPDATE SET
                        status = 'applied',
                        applied_at = EXCLUDED.applied_at,
                        error = NULL,
                        result = EXCLUDED.result
                    WHERE rollup_mutations.status <> 'applied'
                    "#,
                )
                .bind(principal_id)
                .bind(mutation_id)
                .bind(now)
                .bind(Json(result))
                .execute(&mut **tx)
                .await?
                .rows_affected();

                if claimed == 0 {
                    return Err(StoreError::AlreadyApplied(mutation_id.clone()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn get_source_item(
        &self,
        principal_id: Uuid,
        item_id: &str,
    ) -> Result<Option<SourceItem>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_source_item"])
            .start_timer();

        let row = sqlx::query_as::<_, SourceItemRow>(
            r#"
            SELECT principal_id, item_id, access_token, cursor, last_synced_at
            FROM source_items
            WHERE principal_id = $1 AND item_id = $2
            "#,
        )
        .bind(principal_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(row.map(SourceItem::from))
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn list_source_items(&self, principal_id: Uuid) -> Result<Vec<SourceItem>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_source_items"])
            .start_timer();

        let rows = sqlx::query_as::<_, SourceItemRow>(
            r#"
            SELECT principal_id, item_id, access_token, cursor, last_synced_at
            FROM source_items
            WHERE principal_id = $1
            ORDER BY item_id
            "#,
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(rows.into_iter().map(SourceItem::from).collect())
    }

    #[instrument(skip(self, ids), fields(principal_id = %principal_id, count = ids.len()))]
    async fn get_snapshots(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<HashMap<String, TransactionSnapshot>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_snapshots"])
            .start_timer();

        let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {} FROM transaction_snapshots WHERE principal_id = $1 AND id = ANY($2)",
            SNAPSHOT_COLUMNS
        ))
        .bind(principal_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();

        rows.into_iter()
            .map(|row| {
                let snapshot = TransactionSnapshot::try_from(row)?;
                Ok((snapshot.id.clone(), snapshot))
            })
            .collect()
    }

    #[instrument(skip(self, ids), fields(principal_id = %principal_id, count = ids.len()))]
    async fn get_overrides(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_overrides"])
            .start_timer();

        let found = sqlx::query_scalar::<_, String>(
            r#"
            SELECT transaction_id FROM transaction_overrides
            WHERE principal_id = $1 AND transaction_id = ANY($2)
            "#,
        )
        .bind(principal_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(found)
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn get_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_mutation"])
            .start_timer();

        let row = sqlx::query_as::<_, MutationRow>(&format!(
            "SELECT {} FROM rollup_mutations WHERE principal_id = $1 AND mutation_id = $2",
            MUTATION_COLUMNS
        ))
        .bind(principal_id)
        .bind(mutation_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        row.map(MutationRecord::try_from).transpose()
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn begin_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<MutationRecord, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_mutation"])
            .start_timer();

        // Inserts pending, or resets a failed record; pending/applied are kept.
        sqlx::query(
            r#"
            INSERT INTO rollup_mutations (principal_id, mutation_id, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (principal_id, mutation_id) DO UPDATE SET status = 'pending', error = NULL
            WHERE rollup_mutations.status = 'failed'
            "#,
        )
        .bind(principal_id)
        .bind(mutation_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, MutationRow>(&format!(
            "SELECT {} FROM rollup_mutations WHERE principal_id = $1 AND mutation_id = $2",
            MUTATION_COLUMNS
        ))
        .bind(principal_id)
        .bind(mutation_id)
        .fetch_one(&self.pool)
        .await?;

        timer.observe_duration();
        MutationRecord::try_from(row)
    }

    #[instrument(skip(self, error), fields(principal_id = %principal_id))]
    async fn fail_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rollup_mutations (principal_id, mutation_id, status, error)
            VALUES ($1, $2, 'failed', $3)
            ON CONFLICT (principal_id, mutation_id) DO UPDATE SET status = 'failed', error = EXCLUDED.error
            WHERE rollup_mutations.status <> 'applied'
            "#,
        )
        .bind(principal_id)
        .bind(mutation_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn get_rollup(
        &self,
        principal_id: Uuid,
        period_key: &str,
        category_id: &str,
    ) -> Result<Option<RollupBucket>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_rollup"])
            .start_timer();

        let row = sqlx::query_as::<_, BucketRow>(&format!(
            "SELECT {} FROM rollup_buckets WHERE principal_id = $1 AND period_key = $2 AND category_id = $3",
            BUCKET_COLUMNS
        ))
        .bind(principal_id)
        .bind(period_key)
        .bind(category_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(row.map(RollupBucket::from))
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn list_rollups(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rollups"])
            .start_timer();

        let rows = sqlx::query_as::<_, BucketRow>(&format!(
            "SELECT {} FROM rollup_buckets WHERE principal_id = $1 AND period_key = $2 ORDER BY category_id",
            BUCKET_COLUMNS
        ))
        .bind(principal_id)
        .bind(period_key)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(rows.into_iter().map(RollupBucket::from).collect())
    }

    #[instrument(skip(self), fields(principal_id = %principal_id))]
    async fn get_period_summary(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Option<PeriodSummary>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_period_summary"])
            .start_timer();

        let row = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT principal_id, period_key, expense_total, income_total, net, updated_at
            FROM period_summaries
            WHERE principal_id = $1 AND period_key = $2
            "#,
        )
        .bind(principal_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(row.map(PeriodSummary::from))
    }

    /// One SQL transaction per batch; any failing op rolls back the rest.
    #[instrument(skip(self, batch), fields(ops = batch.len()))]
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for op in batch.ops() {
            if let Err(e) = Self::apply_op(&mut tx, op, now).await {
                tx.rollback().await.ok();
                return Err(e);
            }
        }

        tx.commit().await?;
        timer.observe_duration();

        debug!(ops = batch.len(), "Write batch committed");
        Ok(())
    }
}

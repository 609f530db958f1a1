//! Ledger store port: bounded reads plus an all-or-nothing write batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    ApplyResult, MutationRecord, PeriodSummary, RollupBucket, RollupField, SourceItem,
    TransactionSnapshot,
};

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpsertSnapshot(TransactionSnapshot),
    DeleteSnapshot {
        principal_id: Uuid,
        transaction_id: String,
    },
    SetCursor {
        principal_id: Uuid,
        item_id: String,
        cursor: String,
        synced_at: DateTime<Utc>,
    },
    /// Upsert-increment of one bucket counter.
    IncrementRollup {
        principal_id: Uuid,
        period_key: String,
        category_id: String,
        category: String,
        field: RollupField,
        amount: Decimal,
    },
    /// Upsert-increment of one period summary counter; `net` moves with it.
    IncrementSummary {
        principal_id: Uuid,
        period_key: String,
        field: RollupField,
        amount: Decimal,
    },
    /// Mark a mutation applied. The whole batch fails with
    /// [`StoreError::AlreadyApplied`] if it already is.
    ClaimMutation {
        principal_id: Uuid,
        mutation_id: String,
        result: ApplyResult,
    },
}

/// Operations committed together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_snapshot(&mut self, snapshot: TransactionSnapshot) -> &mut Self {
        self.ops.push(WriteOp::UpsertSnapshot(snapshot));
        self
    }

    pub fn delete_snapshot(&mut self, principal_id: Uuid, transaction_id: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DeleteSnapshot {
            principal_id,
            transaction_id: transaction_id.into(),
        });
        self
    }

    pub fn set_cursor(
        &mut self,
        principal_id: Uuid,
        item_id: impl Into<String>,
        cursor: impl Into<String>,
        synced_at: DateTime<Utc>,
    ) -> &mut Self {
        self.ops.push(WriteOp::SetCursor {
            principal_id,
            item_id: item_id.into(),
            cursor: cursor.into(),
            synced_at,
        });
        self
    }

    pub fn increment_rollup(
        &mut self,
        principal_id: Uuid,
        period_key: impl Into<String>,
        category_id: impl Into<String>,
        category: impl Into<String>,
        field: RollupField,
        amount: Decimal,
    ) -> &mut Self {
        self.ops.push(WriteOp::IncrementRollup {
            principal_id,
            period_key: period_key.into(),
            category_id: category_id.into(),
            category: category.into(),
            field,
            amount,
        });
        self
    }

    pub fn increment_summary(
        &mut self,
        principal_id: Uuid,
        period_key: impl Into<String>,
        field: RollupField,
        amount: Decimal,
    ) -> &mut Self {
        self.ops.push(WriteOp::IncrementSummary {
            principal_id,
            period_key: period_key.into(),
            field,
            amount,
        });
        self
    }

    pub fn claim_mutation(
        &mut self,
        principal_id: Uuid,
        mutation_id: impl Into<String>,
        result: ApplyResult,
    ) -> &mut Self {
        self.ops.push(WriteOp::ClaimMutation {
            principal_id,
            mutation_id: mutation_id.into(),
            result,
        });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage collaborator shared by the ledger writer and rollup aggregator.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_source_item(
        &self,
        principal_id: Uuid,
        item_id: &str,
    ) -> Result<Option<SourceItem>, StoreError>;

    async fn list_source_items(&self, principal_id: Uuid) -> Result<Vec<SourceItem>, StoreError>;

    /// Bounded bulk read; ids without a snapshot are absent from the map.
    async fn get_snapshots(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<HashMap<String, TransactionSnapshot>, StoreError>;

    /// Subset of `ids` that carry a manual override marker.
    async fn get_overrides(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    async fn get_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StoreError>;

    /// Record a mutation as pending. An existing record is left untouched
    /// unless it is `failed`, in which case it is reset to pending.
    /// Returns the record as stored afterwards.
    async fn begin_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<MutationRecord, StoreError>;

    /// Mark a pending mutation failed. Applied records are never downgraded.
    async fn fail_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn get_rollup(
        &self,
        principal_id: Uuid,
        period_key: &str,
        category_id: &str,
    ) -> Result<Option<RollupBucket>, StoreError>;

    async fn list_rollups(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Vec<RollupBucket>, StoreError>;

    async fn get_period_summary(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Option<PeriodSummary>, StoreError>;

    /// Apply every op of the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

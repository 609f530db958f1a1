//! In-process [`LedgerStore`] used for embedding and tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    MutationRecord, MutationStatus, PeriodSummary, RollupBucket, RollupField, SourceItem,
    TransactionSnapshot,
};
use crate::services::store::{LedgerStore, WriteBatch, WriteOp};

type Key = (Uuid, String);
type BucketKey = (Uuid, String, String);

#[derive(Default)]
struct State {
    items: HashMap<Key, SourceItem>,
    snapshots: HashMap<Key, TransactionSnapshot>,
    overrides: HashSet<Key>,
    mutations: HashMap<Key, MutationRecord>,
    rollups: HashMap<BucketKey, RollupBucket>,
    summaries: HashMap<Key, PeriodSummary>,
}

/// All state lives behind one lock, so a commit is trivially atomic.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
    failing_commits: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_source_item(&self, item: SourceItem) {
        let mut state = self.state.lock().await;
        state
            .items
            .insert((item.principal_id, item.item_id.clone()), item);
    }

    pub async fn insert_override(&self, principal_id: Uuid, transaction_id: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.overrides.insert((principal_id, transaction_id.into()));
    }

    pub async fn insert_snapshot(&self, snapshot: TransactionSnapshot) {
        let mut state = self.state.lock().await;
        state
            .snapshots
            .insert((snapshot.principal_id, snapshot.id.clone()), snapshot);
    }

    pub async fn snapshot(&self, principal_id: Uuid, id: &str) -> Option<TransactionSnapshot> {
        let state = self.state.lock().await;
        state.snapshots.get(&(principal_id, id.to_string())).cloned()
    }

    pub async fn snapshot_count(&self, principal_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .snapshots
            .keys()
            .filter(|(p, _)| *p == principal_id)
            .count()
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn bump(expense: &mut Decimal, income: &mut Decimal, field: RollupField, amount: Decimal) {
    match field {
        RollupField::ExpenseTotal => *expense += amount,
        RollupField::IncomeTotal => *income += amount,
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_source_item(
        &self,
        principal_id: Uuid,
        item_id: &str,
    ) -> Result<Option<SourceItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.items.get(&(principal_id, item_id.to_string())).cloned())
    }

    async fn list_source_items(&self, principal_id: Uuid) -> Result<Vec<SourceItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<SourceItem> = state
            .items
            .values()
            .filter(|i| i.principal_id == principal_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(items)
    }

    async fn get_snapshots(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<HashMap<String, TransactionSnapshot>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .snapshots
                    .get(&(principal_id, id.clone()))
                    .map(|s| (id.clone(), s.clone()))
            })
            .collect())
    }

    async fn get_overrides(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter(|id| state.overrides.contains(&(principal_id, (*id).clone())))
            .cloned()
            .collect())
    }

    async fn get_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<Option<MutationRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mutations
            .get(&(principal_id, mutation_id.to_string()))
            .cloned())
    }

    async fn begin_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
    ) -> Result<MutationRecord, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .mutations
            .entry((principal_id, mutation_id.to_string()))
            .or_insert_with(|| MutationRecord::pending(principal_id, mutation_id));
        if record.status == MutationStatus::Failed {
            record.status = MutationStatus::Pending;
            record.error = None;
        }
        Ok(record.clone())
    }

    async fn fail_mutation(
        &self,
        principal_id: Uuid,
        mutation_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .mutations
            .entry((principal_id, mutation_id.to_string()))
            .or_insert_with(|| MutationRecord::pending(principal_id, mutation_id));
        if record.status != MutationStatus::Applied {
            record.status = MutationStatus::Failed;
            record.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_rollup(
        &self,
        principal_id: Uuid,
        period_key: &str,
        category_id: &str,
    ) -> Result<Option<RollupBucket>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rollups
            .get(&(principal_id, period_key.to_string(), category_id.to_string()))
            .cloned())
    }

    async fn list_rollups(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        let state = self.state.lock().await;
        let mut buckets: Vec<RollupBucket> = state
            .rollups
            .values()
            .filter(|b| b.principal_id == principal_id && b.period_key == period_key)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| a.category_id.cmp(&b.category_id));
        Ok(buckets)
    }

    async fn get_period_summary(
        &self,
        principal_id: Uuid,
        period_key: &str,
    ) -> Result<Option<PeriodSummary>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .summaries
            .get(&(principal_id, period_key.to_string()))
            .cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        if self.take_injected_failure() {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "injected commit failure"
            )));
        }

        // Check every precondition before touching anything.
        for op in batch.ops() {
            if let WriteOp::ClaimMutation {
                principal_id,
                mutation_id,
                ..
            } = op
            {
                let applied = state
                    .mutations
                    .get(&(*principal_id, mutation_id.clone()))
                    .is_some_and(|m| m.status == MutationStatus::Applied);
                if applied {
                    return Err(StoreError::AlreadyApplied(mutation_id.clone()));
                }
            }
        }

        let now = Utc::now();
        for op in batch.ops().iter().cloned() {
            match op {
                WriteOp::UpsertSnapshot(snapshot) => {
                    state
                        .snapshots
                        .insert((snapshot.principal_id, snapshot.id.clone()), snapshot);
                }
                WriteOp::DeleteSnapshot {
                    principal_id,
                    transaction_id,
                } => {
                    state.snapshots.remove(&(principal_id, transaction_id));
                }
                WriteOp::SetCursor {
                    principal_id,
                    item_id,
                    cursor,
                    synced_at,
                } => {
                    if let Some(item) = state.items.get_mut(&(principal_id, item_id)) {
                        item.cursor = Some(cursor);
                        item.last_synced_at = Some(synced_at);
                    }
                }
                WriteOp::IncrementRollup {
                    principal_id,
                    period_key,
                    category_id,
                    category,
                    field,
                    amount,
                } => {
                    let bucket = state
                        .rollups
                        .entry((principal_id, period_key.clone(), category_id.clone()))
                        .or_insert_with(|| RollupBucket {
                            principal_id,
                            period_key,
                            category_id,
                            category,
                            expense_total: Decimal::ZERO,
                            income_total: Decimal::ZERO,
                            updated_at: now,
                        });
                    bump(&mut bucket.expense_total, &mut bucket.income_total, field, amount);
                    bucket.updated_at = now;
                }
                WriteOp::IncrementSummary {
                    principal_id,
                    period_key,
                    field,
                    amount,
                } => {
                    let summary = state
                        .summaries
                        .entry((principal_id, period_key.clone()))
                        .or_insert_with(|| PeriodSummary {
                            principal_id,
                            period_key,
                            expense_total: Decimal::ZERO,
                            income_total: Decimal::ZERO,
                            net: Decimal::ZERO,
                            updated_at: now,
                        });
                    bump(&mut summary.expense_total, &mut summary.income_total, field, amount);
                    summary.net = summary.income_total - summary.expense_total;
                    summary.updated_at = now;
                }
                WriteOp::ClaimMutation {
                    principal_id,
                    mutation_id,
                    result,
                } => {
                    let record = state
                        .mutations
                        .entry((principal_id, mutation_id.clone()))
                        .or_insert_with(|| MutationRecord::pending(principal_id, mutation_id));
                    record.status = MutationStatus::Applied;
                    record.applied_at = Some(now);
                    record.error = None;
                    record.result = Some(result);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

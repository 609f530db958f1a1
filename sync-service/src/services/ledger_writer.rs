//! Per-item sync: fetch, scope, diff against prior snapshots, commit.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{
    Delta, FeedRecord, ItemSyncResult, RemovedRecord, SyncScope, TransactionSnapshot,
};
use crate::services::classifier::{category_from, classify};
use crate::services::delta_builder::{
    build_add_deltas, build_modified_deltas, build_removed_deltas,
};
use crate::services::fetcher::FeedFetcher;
use crate::services::metrics::{DELTAS_TOTAL, TRANSACTIONS_TOTAL};
use crate::services::provider::FeedProvider;
use crate::services::store::{LedgerStore, WriteBatch};

/// Keys per bounded store read.
pub const SNAPSHOT_READ_CHUNK: usize = 100;

pub struct LedgerWriter<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    fetcher: FeedFetcher<P>,
}

/// Build the canonical snapshot for a feed record owned by `item_id`.
pub fn snapshot_from_record(
    principal_id: Uuid,
    item_id: &str,
    record: &FeedRecord,
    now: DateTime<Utc>,
) -> TransactionSnapshot {
    let classification = classify(record);
    TransactionSnapshot {
        id: record.id.clone(),
        principal_id,
        source_item_id: item_id.to_string(),
        date: record.date,
        txn_type: classification.txn_type,
        amount: classification.amount,
        category: category_from(record),
        pending: record.pending,
        currency: record.currency.clone(),
        updated_at: now,
    }
}

impl<S, P> LedgerWriter<S, P>
where
    S: LedgerStore + ?Sized,
    P: FeedProvider + ?Sized,
{
    pub fn new(store: Arc<S>, fetcher: FeedFetcher<P>) -> Self {
        Self { store, fetcher }
    }

    /// Sync one tracked source item and commit the result atomically.
    ///
    /// The fetch has already reduced each transaction id to its net change,
    /// so every id is diffed once against its stored prior. Removals are
    /// honored regardless of `scope`. Transactions carrying a
    /// manual override keep their ledger snapshot current but contribute no
    /// deltas.
    #[instrument(skip(self, scope), fields(principal_id = %principal_id, item_id = %item_id))]
    pub async fn sync_item(
        &self,
        principal_id: Uuid,
        item_id: &str,
        scope: Option<&SyncScope>,
    ) -> Result<ItemSyncResult, SyncError> {
        let item = self
            .store
            .get_source_item(principal_id, item_id)
            .await
            .map_err(SyncError::Store)?
            .ok_or_else(|| SyncError::ItemNotFound(item_id.to_string()))?;

        let fetched = self
            .fetcher
            .fetch_all(&item.access_token, item.cursor.as_deref())
            .await?;

        let in_scope = |r: &FeedRecord| scope.map_or(true, |s| s.contains(r.date));
        let added: Vec<FeedRecord> = fetched.added.into_iter().filter(in_scope).collect();
        let modified: Vec<FeedRecord> = fetched.modified.into_iter().filter(in_scope).collect();

        let prior_ids: Vec<String> = modified
            .iter()
            .map(|r| r.id.clone())
            .chain(fetched.removed.iter().map(|r| r.id.clone()))
            .collect();
        let priors = self.read_snapshots(principal_id, &prior_ids).await?;
        // Removals of ids the ledger never held change nothing.
        let removed: Vec<RemovedRecord> = fetched
            .removed
            .into_iter()
            .filter(|r| priors.contains_key(&r.id))
            .collect();

        let touched_ids: Vec<String> = added
            .iter()
            .map(|r| r.id.clone())
            .chain(prior_ids.iter().cloned())
            .collect();
        let overridden = self.read_overrides(principal_id, &touched_ids).await?;

        let deltas = build_deltas(&added, &modified, &removed, &priors, &overridden);

        let now = Utc::now();
        let mut batch = WriteBatch::new();
        for record in added.iter().chain(modified.iter()) {
            batch.upsert_snapshot(snapshot_from_record(principal_id, item_id, record, now));
        }
        for r in &removed {
            batch.delete_snapshot(principal_id, r.id.clone());
        }
        batch.set_cursor(principal_id, item_id, fetched.next_cursor.clone(), now);

        self.store.commit(batch).await.map_err(SyncError::Commit)?;

        let written = added.len() + modified.len();
        TRANSACTIONS_TOTAL
            .with_label_values(&["written"])
            .inc_by(written as f64);
        TRANSACTIONS_TOTAL
            .with_label_values(&["removed"])
            .inc_by(removed.len() as f64);
        for delta in &deltas {
            DELTAS_TOTAL.with_label_values(&[delta.op().as_str()]).inc();
        }

        info!(
            pages = fetched.pages,
            written,
            removed = removed.len(),
            deltas = deltas.len(),
            overridden = overridden.len(),
            has_more = fetched.has_more,
            "Source item synced"
        );

        Ok(ItemSyncResult {
            item_id: item_id.to_string(),
            written,
            removed: removed.len(),
            new_cursor: fetched.next_cursor,
            has_more: fetched.has_more,
            deltas,
        })
    }

    async fn read_snapshots(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<HashMap<String, TransactionSnapshot>, SyncError> {
        let ids = dedup(ids);
        let mut priors = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(SNAPSHOT_READ_CHUNK) {
            let found = self
                .store
                .get_snapshots(principal_id, chunk)
                .await
                .map_err(SyncError::Store)?;
            priors.extend(found);
        }
        Ok(priors)
    }

    async fn read_overrides(
        &self,
        principal_id: Uuid,
        ids: &[String],
    ) -> Result<HashSet<String>, SyncError> {
        let ids = dedup(ids);
        let mut overridden = HashSet::new();
        for chunk in ids.chunks(SNAPSHOT_READ_CHUNK) {
            let found = self
                .store
                .get_overrides(principal_id, chunk)
                .await
                .map_err(SyncError::Store)?;
            overridden.extend(found);
        }
        Ok(overridden)
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn build_deltas(
    added: &[FeedRecord],
    modified: &[FeedRecord],
    removed: &[RemovedRecord],
    priors: &HashMap<String, TransactionSnapshot>,
    overridden: &HashSet<String>,
) -> Vec<Delta> {
    let keep = |id: &String| !overridden.contains(id);
    let added: Vec<FeedRecord> = added.iter().filter(|r| keep(&r.id)).cloned().collect();
    let modified: Vec<FeedRecord> = modified.iter().filter(|r| keep(&r.id)).cloned().collect();
    let removed: Vec<RemovedRecord> = removed.iter().filter(|r| keep(&r.id)).cloned().collect();

    let mut deltas = build_add_deltas(&added);
    deltas.extend(build_modified_deltas(&modified, priors));
    deltas.extend(build_removed_deltas(&removed, priors));
    deltas
}

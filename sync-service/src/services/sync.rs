//! Principal-wide sync: every tracked item, then one rollup apply.

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::models::{
    ApplyResult, Delta, Granularity, ItemSyncResult, SourceItem, SyncScope, SyncSummary,
};
use crate::services::fetcher::FeedFetcher;
use crate::services::ledger_writer::LedgerWriter;
use crate::services::metrics::ITEM_SYNCS_TOTAL;
use crate::services::provider::FeedProvider;
use crate::services::rollup::RollupAggregator;
use crate::services::store::LedgerStore;

/// Cursor range one item advanced over during a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRange {
    pub item_id: String,
    pub before: Option<String>,
    pub after: String,
}

/// Stable mutation id for the rollup apply of a principal-wide sync.
///
/// Re-delivering the same cursor ranges yields the same id, so the
/// aggregator applies them at most once.
pub fn derive_mutation_id(principal_id: Uuid, ranges: &[CursorRange]) -> String {
    let mut sorted: Vec<&CursorRange> = ranges.iter().collect();
    sorted.sort_by(|a, b| a.item_id.cmp(&b.item_id));

    let mut hasher = Sha256::new();
    hasher.update(principal_id.as_bytes());
    for range in sorted {
        hasher.update([0x1e]);
        hasher.update(range.item_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(range.before.as_deref().unwrap_or("").as_bytes());
        hasher.update([0x1f]);
        hasher.update(range.after.as_bytes());
    }
    format!("sync-{}", hex::encode(hasher.finalize()))
}

pub struct SyncService<S: ?Sized, P: ?Sized> {
    store: Arc<S>,
    writer: LedgerWriter<S, P>,
    aggregator: RollupAggregator<S>,
    settings: SyncSettings,
}

impl<S, P> SyncService<S, P>
where
    S: LedgerStore + ?Sized,
    P: FeedProvider + ?Sized,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, settings: SyncSettings) -> Self {
        let fetcher = FeedFetcher::new(
            provider,
            settings.max_pages,
            settings.max_pagination_restarts,
        );
        Self {
            writer: LedgerWriter::new(store.clone(), fetcher),
            aggregator: RollupAggregator::new(store.clone()),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Sync a single source item. Its deltas are returned, not aggregated.
    pub async fn sync_item(
        &self,
        principal_id: Uuid,
        item_id: &str,
        scope: Option<&SyncScope>,
    ) -> Result<ItemSyncResult, SyncError> {
        check_scope(scope)?;
        let result = self.writer.sync_item(principal_id, item_id, scope).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        ITEM_SYNCS_TOTAL.with_label_values(&[status]).inc();
        result
    }

    /// Apply externally supplied deltas.
    pub async fn apply_rollups(
        &self,
        principal_id: Uuid,
        deltas: &[Delta],
        granularity: Option<Granularity>,
        mutation_id: Option<&str>,
    ) -> Result<ApplyResult, SyncError> {
        let granularity = granularity.unwrap_or(self.settings.default_granularity);
        self.aggregator
            .apply(principal_id, deltas, granularity, mutation_id)
            .await
    }

    /// Sync every tracked item of a principal and aggregate the combined
    /// deltas in one apply.
    ///
    /// Item failures are counted and logged, never fatal to siblings. A
    /// failed rollup apply is reported in the summary, since the committed
    /// snapshots remain the source of truth.
    #[instrument(skip(self, scope, mutation_id), fields(principal_id = %principal_id))]
    pub async fn sync_principal(
        &self,
        principal_id: Uuid,
        scope: Option<&SyncScope>,
        granularity: Option<Granularity>,
        mutation_id: Option<String>,
    ) -> Result<SyncSummary, SyncError> {
        check_scope(scope)?;

        let items = self
            .store
            .list_source_items(principal_id)
            .await
            .map_err(SyncError::Store)?;

        let outcomes: Vec<(SourceItem, Result<ItemSyncResult, SyncError>)> =
            stream::iter(items)
                .map(|item| async move {
                    let result = self.writer.sync_item(principal_id, &item.item_id, scope).await;
                    (item, result)
                })
                .buffered(self.settings.item_concurrency.max(1))
                .collect()
                .await;

        let mut summary = SyncSummary::default();
        let mut deltas = Vec::new();
        let mut ranges = Vec::new();

        for (item, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    ITEM_SYNCS_TOTAL.with_label_values(&["ok"]).inc();
                    summary.items_processed += 1;
                    summary.transactions_written += result.written;
                    summary.transactions_removed += result.removed;
                    summary.last_cursor = Some(result.new_cursor.clone());
                    ranges.push(CursorRange {
                        item_id: result.item_id,
                        before: item.cursor,
                        after: result.new_cursor,
                    });
                    deltas.extend(result.deltas);
                }
                Err(e) => {
                    ITEM_SYNCS_TOTAL.with_label_values(&["error"]).inc();
                    summary.items_failed += 1;
                    warn!(
                        item_id = %item.item_id,
                        error = %e,
                        kind = e.kind(),
                        retryable = e.is_retryable(),
                        "Source item sync failed"
                    );
                }
            }
        }

        summary.delta_count = deltas.len();

        if !deltas.is_empty() {
            let mutation_id = mutation_id.or_else(|| {
                self.settings
                    .derive_mutation_ids
                    .then(|| derive_mutation_id(principal_id, &ranges))
            });

            match self
                .apply_rollups(principal_id, &deltas, granularity, mutation_id.as_deref())
                .await
            {
                Ok(result) => summary.rollup_applied = result.applied,
                Err(e) => {
                    warn!(error = %e, "Rollup apply failed; snapshots are committed");
                    summary.rollup_error = Some(e.to_string());
                }
            }
            summary.mutation_id = mutation_id;
        }

        info!(
            items_processed = summary.items_processed,
            items_failed = summary.items_failed,
            written = summary.transactions_written,
            removed = summary.transactions_removed,
            deltas = summary.delta_count,
            rollup_applied = summary.rollup_applied,
            "Principal sync finished"
        );

        Ok(summary)
    }
}

fn check_scope(scope: Option<&SyncScope>) -> Result<(), SyncError> {
    match scope {
        Some(s) if !s.is_valid() => Err(SyncError::Validation(
            "scope start must not be after scope end".to_string(),
        )),
        _ => Ok(()),
    }
}

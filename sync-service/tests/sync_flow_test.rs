//! Principal-wide sync against the in-memory store and a scripted feed.

mod common;

use async_trait::async_trait;
use common::{date, page, record, removed, FakeFeed, TestHarness};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use sync_service::config::SyncSettings;
use sync_service::error::StoreError;
use sync_service::models::{
    Delta, Granularity, MutationRecord, MutationStatus, PeriodSummary, RollupBucket, SourceItem,
    SyncScope, TransactionSnapshot,
};
use sync_service::services::delta_builder::summarize;
use sync_service::services::{
    FeedProvider, LedgerStore, MemoryLedgerStore, SyncService, WriteBatch, WriteOp,
};
use uuid::Uuid;

async fn totals(store: &MemoryLedgerStore, principal: Uuid, period: &str, cat: &str) -> (Decimal, Decimal) {
    store
        .get_rollup(principal, period, cat)
        .await
        .unwrap()
        .map(|b| (b.expense_total, b.income_total))
        .unwrap_or_default()
}

fn first_page() -> sync_service::models::FeedPage {
    page(
        vec![
            record("t1", date(2025, 1, 1), dec!(10), "Food"),
            record("t2", date(2025, 1, 1), dec!(-50), "Salary"),
            record("t3", date(2025, 1, 2), dec!(3), "Food"),
            record("t4", date(2025, 1, 2), dec!(5), "Misc"),
            record("t5", date(2025, 1, 2), dec!(7), "Misc"),
        ],
        vec![],
        vec![],
        "c1",
        false,
    )
}

#[tokio::test]
async fn two_syncs_keep_ledger_and_rollups_consistent() {
    let h = TestHarness::new();
    h.store
        .insert_source_item(SourceItem::new(h.principal_id, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());
    h.feed.script(
        "tok-1",
        Some("c1"),
        page(
            vec![],
            vec![
                record("t4", date(2025, 1, 2), dec!(8), "Misc"),
                record("t5", date(2025, 1, 2), dec!(-7), "Misc"),
            ],
            vec![removed("t3")],
            "c2",
            false,
        ),
    );

    let first = h
        .service
        .sync_principal(h.principal_id, None, None, None)
        .await
        .unwrap();
    assert_eq!(first.items_processed, 1);
    assert_eq!(first.transactions_written, 5);
    assert_eq!(first.delta_count, 5);
    assert!(first.rollup_applied);
    assert_eq!(first.last_cursor.as_deref(), Some("c1"));

    let second = h
        .service
        .sync_principal(h.principal_id, None, None, None)
        .await
        .unwrap();
    assert_eq!(second.transactions_written, 2);
    assert_eq!(second.transactions_removed, 1);
    assert_eq!(second.delta_count, 3);
    assert!(second.rollup_applied);
    assert_ne!(first.mutation_id, second.mutation_id);

    let p = h.principal_id;
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(10), dec!(0)));
    assert_eq!(totals(&h.store, p, "2025-01", "Salary").await, (dec!(0), dec!(50)));
    assert_eq!(totals(&h.store, p, "2025-01", "Misc").await, (dec!(8), dec!(7)));

    let summary = h.store.get_period_summary(p, "2025-01").await.unwrap().unwrap();
    assert_eq!(summary.expense_total, dec!(18));
    assert_eq!(summary.income_total, dec!(57));
    assert_eq!(summary.net, dec!(39));

    assert_eq!(h.store.snapshot_count(p).await, 4);
    assert!(h.store.snapshot(p, "t3").await.is_none());
    let item = h.store.get_source_item(p, "item-1").await.unwrap().unwrap();
    assert_eq!(item.cursor.as_deref(), Some("c2"));
    assert!(item.last_synced_at.is_some());
}

#[tokio::test]
async fn redelivered_cursor_range_is_applied_once() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());

    let first = h.service.sync_principal(p, None, None, None).await.unwrap();

    // Rewind the cursor so the same page is delivered again.
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    let second = h.service.sync_principal(p, None, None, None).await.unwrap();

    assert!(first.mutation_id.is_some());
    assert_eq!(first.mutation_id, second.mutation_id);
    assert!(second.rollup_applied);
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(13), dec!(0)));
    assert_eq!(totals(&h.store, p, "2025-01", "Misc").await, (dec!(12), dec!(0)));
}

#[tokio::test]
async fn without_derived_ids_redelivery_double_counts() {
    let h = TestHarness::with_settings(SyncSettings {
        derive_mutation_ids: false,
        ..SyncSettings::default()
    });
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());

    let first = h.service.sync_principal(p, None, None, None).await.unwrap();
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.service.sync_principal(p, None, None, None).await.unwrap();

    assert!(first.mutation_id.is_none());
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(26), dec!(0)));
}

#[tokio::test]
async fn caller_mutation_id_is_used() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());

    let summary = h
        .service
        .sync_principal(p, None, Some(Granularity::Weekly), Some("nightly-2025-01-03".to_string()))
        .await
        .unwrap();

    assert_eq!(summary.mutation_id.as_deref(), Some("nightly-2025-01-03"));
    let record = h
        .store
        .get_mutation(p, "nightly-2025-01-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, MutationStatus::Applied);
    assert_eq!(totals(&h.store, p, "2025-W01", "Food").await, (dec!(13), dec!(0)));
}

#[tokio::test]
async fn failing_item_does_not_block_siblings() {
    let h = TestHarness::with_settings(SyncSettings {
        item_concurrency: 2,
        ..SyncSettings::default()
    });
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-bad", "tok-bad"))
        .await;
    h.store
        .insert_source_item(SourceItem::new(p, "item-good", "tok-good"))
        .await;
    h.feed.fail("tok-bad");
    h.feed.script(
        "tok-good",
        None,
        page(
            vec![record("g1", date(2025, 2, 1), dec!(20), "Travel")],
            vec![],
            vec![],
            "good-1",
            false,
        ),
    );

    let summary = h.service.sync_principal(p, None, None, None).await.unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.items_failed, 1);
    assert_eq!(summary.transactions_written, 1);
    assert_eq!(summary.last_cursor.as_deref(), Some("good-1"));
    assert!(summary.rollup_applied);
    assert_eq!(totals(&h.store, p, "2025-02", "Travel").await, (dec!(20), dec!(0)));

    let bad = h.store.get_source_item(p, "item-bad").await.unwrap().unwrap();
    assert!(bad.cursor.is_none());
    assert!(bad.last_synced_at.is_none());
}

#[tokio::test]
async fn overridden_transactions_emit_no_deltas() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.store.insert_override(p, "t1").await;
    h.feed.script("tok-1", None, first_page());

    let summary = h.service.sync_principal(p, None, None, None).await.unwrap();

    assert_eq!(summary.transactions_written, 5);
    assert_eq!(summary.delta_count, 4);
    assert!(h.store.snapshot(p, "t1").await.is_some());
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(3), dec!(0)));
}

#[tokio::test]
async fn scope_filters_additions_but_not_removals() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());
    h.service.sync_principal(p, None, None, None).await.unwrap();

    h.feed.script(
        "tok-1",
        Some("c1"),
        page(
            vec![
                record("in-scope", date(2025, 3, 10), dec!(4), "Food"),
                record("too-old", date(2024, 12, 31), dec!(9), "Food"),
            ],
            vec![],
            vec![removed("t1")],
            "c2",
            false,
        ),
    );
    let scope = SyncScope::between(date(2025, 3, 1), date(2025, 3, 31));
    let summary = h
        .service
        .sync_principal(p, Some(&scope), None, None)
        .await
        .unwrap();

    assert_eq!(summary.transactions_written, 1);
    assert_eq!(summary.transactions_removed, 1);
    assert!(h.store.snapshot(p, "in-scope").await.is_some());
    assert!(h.store.snapshot(p, "too-old").await.is_none());
    assert!(h.store.snapshot(p, "t1").await.is_none());
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(3), dec!(0)));
    assert_eq!(totals(&h.store, p, "2025-03", "Food").await, (dec!(4), dec!(0)));
}

#[tokio::test]
async fn single_item_sync_returns_deltas_without_aggregating() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());

    let result = h.service.sync_item(p, "item-1", None).await.unwrap();

    assert_eq!(result.new_cursor, "c1");
    assert_eq!(result.deltas.len(), 5);
    let summary = summarize(&result.deltas);
    assert_eq!(summary.expense, dec!(25));
    assert_eq!(summary.income, dec!(50));
    assert!(h.store.get_period_summary(p, "2025-01").await.unwrap().is_none());
}

#[tokio::test]
async fn three_page_feed_resumes_from_last_cursor() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script(
        "tok-1",
        None,
        page(vec![record("a", date(2025, 1, 5), dec!(1), "Food")], vec![], vec![], "p1", true),
    );
    h.feed.script(
        "tok-1",
        Some("p1"),
        page(vec![record("b", date(2025, 1, 6), dec!(2), "Food")], vec![], vec![], "p2", true),
    );
    h.feed.script(
        "tok-1",
        Some("p2"),
        page(vec![record("c", date(2025, 1, 7), dec!(3), "Food")], vec![], vec![], "p3", false),
    );

    let summary = h.service.sync_principal(p, None, None, None).await.unwrap();
    assert_eq!(summary.transactions_written, 3);
    assert_eq!(summary.last_cursor.as_deref(), Some("p3"));

    h.service.sync_principal(p, None, None, None).await.unwrap();
    let calls = h.feed.calls();
    assert_eq!(calls.last().unwrap().1.as_deref(), Some("p3"));
    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (dec!(6), dec!(0)));
}

#[tokio::test]
async fn repeated_ids_across_pages_keep_rollups_matching_ledger() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script(
        "tok-1",
        None,
        page(vec![record("m", date(2025, 1, 3), dec!(20), "Misc")], vec![], vec![], "c1", false),
    );
    h.service.sync_principal(p, None, None, None).await.unwrap();

    h.feed.script(
        "tok-1",
        Some("c1"),
        page(
            vec![
                record("x", date(2025, 1, 4), dec!(10), "Food"),
                record("y", date(2025, 1, 4), dec!(4), "Food"),
            ],
            vec![record("m", date(2025, 1, 3), dec!(25), "Misc")],
            vec![],
            "c2",
            true,
        ),
    );
    h.feed.script(
        "tok-1",
        Some("c2"),
        page(
            vec![],
            vec![
                record("y", date(2025, 1, 4), dec!(6), "Food"),
                record("m", date(2025, 1, 3), dec!(30), "Misc"),
            ],
            vec![removed("x")],
            "c3",
            false,
        ),
    );
    let summary = h.service.sync_principal(p, None, None, None).await.unwrap();

    assert!(summary.rollup_applied);
    assert_eq!(summary.transactions_written, 2);
    assert_eq!(summary.transactions_removed, 0);
    assert_eq!(summary.last_cursor.as_deref(), Some("c3"));

    assert!(h.store.snapshot(p, "x").await.is_none());
    let y = h.store.snapshot(p, "y").await.unwrap();
    let m = h.store.snapshot(p, "m").await.unwrap();
    assert_eq!((y.amount, m.amount), (dec!(6), dec!(30)));

    assert_eq!(totals(&h.store, p, "2025-01", "Food").await, (y.amount, dec!(0)));
    assert_eq!(totals(&h.store, p, "2025-01", "Misc").await, (m.amount, dec!(0)));
    let period = h.store.get_period_summary(p, "2025-01").await.unwrap().unwrap();
    assert_eq!(period.expense_total, y.amount + m.amount);
}

#[tokio::test]
async fn unknown_item_is_reported() {
    let h = TestHarness::new();
    let err = h
        .service
        .sync_item(h.principal_id, "missing", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "item_not_found");
}

/// Delegates to the memory store but fails every commit that touches rollups.
struct RollupFailingStore {
    inner: MemoryLedgerStore,
}

#[async_trait]
impl LedgerStore for RollupFailingStore {
    async fn get_source_item(&self, p: Uuid, item_id: &str) -> Result<Option<SourceItem>, StoreError> {
        self.inner.get_source_item(p, item_id).await
    }

    async fn list_source_items(&self, p: Uuid) -> Result<Vec<SourceItem>, StoreError> {
        self.inner.list_source_items(p).await
    }

    async fn get_snapshots(
        &self,
        p: Uuid,
        ids: &[String],
    ) -> Result<HashMap<String, TransactionSnapshot>, StoreError> {
        self.inner.get_snapshots(p, ids).await
    }

    async fn get_overrides(&self, p: Uuid, ids: &[String]) -> Result<Vec<String>, StoreError> {
        self.inner.get_overrides(p, ids).await
    }

    async fn get_mutation(&self, p: Uuid, id: &str) -> Result<Option<MutationRecord>, StoreError> {
        self.inner.get_mutation(p, id).await
    }

    async fn begin_mutation(&self, p: Uuid, id: &str) -> Result<MutationRecord, StoreError> {
        self.inner.begin_mutation(p, id).await
    }

    async fn fail_mutation(&self, p: Uuid, id: &str, error: &str) -> Result<(), StoreError> {
        self.inner.fail_mutation(p, id, error).await
    }

    async fn get_rollup(
        &self,
        p: Uuid,
        period: &str,
        category_id: &str,
    ) -> Result<Option<RollupBucket>, StoreError> {
        self.inner.get_rollup(p, period, category_id).await
    }

    async fn list_rollups(&self, p: Uuid, period: &str) -> Result<Vec<RollupBucket>, StoreError> {
        self.inner.list_rollups(p, period).await
    }

    async fn get_period_summary(
        &self,
        p: Uuid,
        period: &str,
    ) -> Result<Option<PeriodSummary>, StoreError> {
        self.inner.get_period_summary(p, period).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let touches_rollups = batch
            .ops()
            .iter()
            .any(|op| matches!(op, WriteOp::IncrementRollup { .. }));
        if touches_rollups {
            return Err(StoreError::Backend(anyhow::anyhow!("rollup table unavailable")));
        }
        self.inner.commit(batch).await
    }
}

#[tokio::test]
async fn rollup_failure_is_soft() {
    common::init_tracing();
    let principal = Uuid::new_v4();
    let store = Arc::new(RollupFailingStore {
        inner: MemoryLedgerStore::new(),
    });
    store
        .inner
        .insert_source_item(SourceItem::new(principal, "item-1", "tok-1"))
        .await;
    let feed = FakeFeed::new();
    feed.script("tok-1", None, first_page());

    let dyn_store: Arc<dyn LedgerStore> = store.clone();
    let dyn_feed: Arc<dyn FeedProvider> = feed;
    let service = SyncService::new(dyn_store, dyn_feed, SyncSettings::default());

    let summary = service
        .sync_principal(principal, None, None, None)
        .await
        .unwrap();

    assert_eq!(summary.items_processed, 1);
    assert_eq!(summary.transactions_written, 5);
    assert!(!summary.rollup_applied);
    assert!(summary.rollup_error.is_some());

    // Ledger and cursor are committed even though aggregation failed.
    assert_eq!(store.inner.snapshot_count(principal).await, 5);
    let item = store.get_source_item(principal, "item-1").await.unwrap().unwrap();
    assert_eq!(item.cursor.as_deref(), Some("c1"));

    let mutation_id = summary.mutation_id.unwrap();
    let record = store.get_mutation(principal, &mutation_id).await.unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Failed);
}

#[tokio::test]
async fn summarize_matches_grouped_classification() {
    let h = TestHarness::new();
    let p = h.principal_id;
    h.store
        .insert_source_item(SourceItem::new(p, "item-1", "tok-1"))
        .await;
    h.feed.script("tok-1", None, first_page());

    let result = h.service.sync_item(p, "item-1", None).await.unwrap();
    let adds: Vec<&Delta> = result
        .deltas
        .iter()
        .filter(|d| matches!(d, Delta::Add(_)))
        .collect();

    assert_eq!(adds.len(), 5);
    let snapshots = h
        .store
        .get_snapshots(p, &["t1", "t2", "t3", "t4", "t5"].map(String::from))
        .await
        .unwrap();
    let expense: Decimal = snapshots
        .values()
        .filter(|s| s.txn_type == sync_service::models::TxnType::Expense)
        .map(|s| s.amount)
        .sum();
    assert_eq!(summarize(&result.deltas).expense, expense);
}

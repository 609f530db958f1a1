//! Common test utilities for sync-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use sync_service::config::SyncSettings;
use sync_service::error::ProviderError;
use sync_service::models::{FeedPage, FeedRecord, RemovedRecord};
use sync_service::services::{FeedProvider, LedgerStore, MemoryLedgerStore, SyncService};
use sync_service::startup::{router, AppState};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,sync_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// In-memory feed keyed by credential and cursor.
///
/// A cursor with no scripted page returns an empty, drained page that keeps
/// the cursor where it is.
#[derive(Default)]
pub struct FakeFeed {
    pages: Mutex<HashMap<(String, Option<String>), FeedPage>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, credential: &str, cursor: Option<&str>, page: FeedPage) {
        self.pages
            .lock()
            .unwrap()
            .insert((credential.to_string(), cursor.map(str::to_string)), page);
    }

    /// Make every call with `credential` fail with an API error.
    pub fn fail(&self, credential: &str) {
        self.failing.lock().unwrap().insert(credential.to_string());
    }

    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedProvider for FakeFeed {
    async fn fetch_page(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((credential.to_string(), cursor.map(str::to_string)));

        if self.failing.lock().unwrap().contains(credential) {
            return Err(ProviderError::Api {
                status: 400,
                code: "ITEM_LOGIN_REQUIRED".to_string(),
                message: "the login details of this item have changed".to_string(),
            });
        }

        let key = (credential.to_string(), cursor.map(str::to_string));
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FeedPage {
                next_cursor: cursor.unwrap_or_default().to_string(),
                ..FeedPage::default()
            }))
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Feed record with a single-level category path.
pub fn record(id: &str, on: NaiveDate, amount: Decimal, category: &str) -> FeedRecord {
    FeedRecord {
        id: id.to_string(),
        date: on,
        amount,
        category: Some(vec![category.to_string()]),
        category_primary: None,
        category_detailed: None,
        polarity_hint: None,
        pending: false,
        currency: Some("USD".to_string()),
    }
}

pub fn removed(id: &str) -> RemovedRecord {
    RemovedRecord { id: id.to_string() }
}

pub fn page(
    added: Vec<FeedRecord>,
    modified: Vec<FeedRecord>,
    removed: Vec<RemovedRecord>,
    next_cursor: &str,
    has_more: bool,
) -> FeedPage {
    FeedPage {
        added,
        modified,
        removed,
        next_cursor: next_cursor.to_string(),
        has_more,
    }
}

/// A sync service over an in-memory store and a scripted feed.
pub struct TestHarness {
    pub principal_id: Uuid,
    pub store: Arc<MemoryLedgerStore>,
    pub feed: Arc<FakeFeed>,
    pub service: Arc<SyncService<dyn LedgerStore, dyn FeedProvider>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        init_tracing();

        let store = Arc::new(MemoryLedgerStore::new());
        let feed = FakeFeed::new();
        let dyn_store: Arc<dyn LedgerStore> = store.clone();
        let dyn_feed: Arc<dyn FeedProvider> = feed.clone();

        Self {
            principal_id: Uuid::new_v4(),
            store,
            feed,
            service: Arc::new(SyncService::new(dyn_store, dyn_feed, settings)),
        }
    }

    pub fn router(&self) -> axum::Router {
        router(AppState::new(self.service.clone(), None))
    }
}

//! Drives the provider's cursor protocol to completion.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::ProviderError;
use crate::models::{FeedPage, FeedRecord, FetchResult, RemovedRecord};
use crate::services::provider::FeedProvider;

pub struct FeedFetcher<P: ?Sized> {
    provider: Arc<P>,
    max_pages: u32,
    max_restarts: u32,
}

impl<P: FeedProvider + ?Sized> FeedFetcher<P> {
    pub fn new(provider: Arc<P>, max_pages: u32, max_restarts: u32) -> Self {
        Self {
            provider,
            max_pages: max_pages.max(1),
            max_restarts,
        }
    }

    /// Fetch every page after `cursor`.
    ///
    /// A provider failure aborts the whole loop: the caller never sees a
    /// cursor for a partially consumed fetch. When the page ceiling is hit
    /// the result carries the cursor of the last consumed page and
    /// `has_more = true`. A mid-pagination feed mutation restarts the loop
    /// from `cursor`, up to `max_restarts` times.
    ///
    /// Each transaction id appears at most once in the result, reduced to its
    /// net change across all consumed pages.
    #[instrument(skip(self, credential, cursor), fields(has_cursor = cursor.is_some()))]
    pub async fn fetch_all(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<FetchResult, ProviderError> {
        let mut restarts = 0;
        loop {
            match self.fetch_from(credential, cursor).await {
                Err(ProviderError::PaginationInvalidated) if restarts < self.max_restarts => {
                    restarts += 1;
                    warn!(restarts, "Feed mutated during pagination, restarting fetch");
                }
                other => return other,
            }
        }
    }

    async fn fetch_from(
        &self,
        credential: &str,
        start: Option<&str>,
    ) -> Result<FetchResult, ProviderError> {
        let mut result = FetchResult::default();
        let mut changes = NetChanges::default();
        let mut cursor = start.map(str::to_string);

        loop {
            let page = self
                .provider
                .fetch_page(credential, cursor.as_deref())
                .await?;
            result.pages += 1;

            let has_more = page.has_more;
            result.next_cursor = page.next_cursor.clone();
            cursor = Some(page.next_cursor.clone());
            changes.absorb(page);

            if !has_more {
                result.has_more = false;
                break;
            }
            if result.pages >= self.max_pages {
                result.has_more = true;
                info!(
                    pages = result.pages,
                    "Page ceiling reached, remaining pages left for the next sync"
                );
                break;
            }
        }

        changes.finish(&mut result);
        Ok(result)
    }
}

/// Net change per transaction id across the pages of one fetch.
///
/// Within a page, additions apply before modifications and modifications
/// before removals.
#[derive(Default)]
struct NetChanges {
    order: Vec<String>,
    entries: HashMap<String, NetChange>,
}

struct NetChange {
    /// The first event was an addition, so the store holds no prior.
    added_here: bool,
    latest: Option<FeedRecord>,
}

impl NetChanges {
    fn absorb(&mut self, page: FeedPage) {
        for record in page.added {
            self.push(record.id.clone(), true, Some(record));
        }
        for record in page.modified {
            self.push(record.id.clone(), false, Some(record));
        }
        for record in page.removed {
            self.push(record.id, false, None);
        }
    }

    fn push(&mut self, id: String, added: bool, latest: Option<FeedRecord>) {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.latest = latest,
            None => {
                self.order.push(id.clone());
                self.entries.insert(
                    id,
                    NetChange {
                        added_here: added,
                        latest,
                    },
                );
            }
        }
    }

    fn finish(mut self, result: &mut FetchResult) {
        for id in self.order {
            let Some(change) = self.entries.remove(&id) else {
                continue;
            };
            match (change.added_here, change.latest) {
                (true, Some(record)) => result.added.push(record),
                // Added and removed within one fetch: nothing to record.
                (true, None) => {}
                (false, Some(record)) => result.modified.push(record),
                (false, None) => result.removed.push(RemovedRecord { id }),
            }
        }
    }
}

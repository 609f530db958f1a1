//! Upstream feed provider port and its HTTP adapter.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::models::{FeedPage, FeedRecord, RemovedRecord};
use crate::services::metrics::{PROVIDER_PAGES_TOTAL, PROVIDER_REQUEST_DURATION};

/// Error code the provider uses when the feed changed between pages.
pub const MUTATION_DURING_PAGINATION: &str = "TRANSACTIONS_SYNC_MUTATION_DURING_PAGINATION";

/// One page of the cursor protocol. `cursor` is `None` on the very first call.
#[async_trait]
pub trait FeedProvider: Send + Sync {
    async fn fetch_page(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage, ProviderError>;
}

/// Client for a `/transactions/sync`-style JSON endpoint.
#[derive(Clone)]
pub struct HttpFeedProvider {
    client: Client,
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    added: Vec<WireTransaction>,
    #[serde(default)]
    modified: Vec<WireTransaction>,
    #[serde(default)]
    removed: Vec<WireRemoved>,
    next_cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    transaction_id: String,
    date: NaiveDate,
    amount: Decimal,
    #[serde(default)]
    iso_currency_code: Option<String>,
    #[serde(default)]
    unofficial_currency_code: Option<String>,
    #[serde(default)]
    category: Option<Vec<String>>,
    #[serde(default)]
    personal_finance_category: Option<WireCategory>,
    #[serde(default)]
    transaction_type: Option<String>,
    #[serde(default)]
    pending: bool,
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    #[serde(default)]
    primary: Option<String>,
    #[serde(default)]
    detailed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRemoved {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl From<WireTransaction> for FeedRecord {
    fn from(t: WireTransaction) -> Self {
        let (category_primary, category_detailed) = match t.personal_finance_category {
            Some(c) => (c.primary, c.detailed),
            None => (None, None),
        };
        FeedRecord {
            id: t.transaction_id,
            date: t.date,
            amount: t.amount,
            category: t.category,
            category_primary,
            category_detailed,
            polarity_hint: t.transaction_type,
            pending: t.pending,
            currency: t.iso_currency_code.or(t.unofficial_currency_code),
        }
    }
}

impl From<SyncResponse> for FeedPage {
    fn from(r: SyncResponse) -> Self {
        FeedPage {
            added: r.added.into_iter().map(FeedRecord::from).collect(),
            modified: r.modified.into_iter().map(FeedRecord::from).collect(),
            removed: r
                .removed
                .into_iter()
                .map(|w| RemovedRecord {
                    id: w.transaction_id,
                })
                .collect(),
            next_cursor: r.next_cursor,
            has_more: r.has_more,
        }
    }
}

impl HttpFeedProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Check if provider credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.secret.expose_secret().is_empty()
    }

    fn decode_error(status: u16, body: &str) -> ProviderError {
        let wire: Option<WireError> = serde_json::from_str(body).ok();
        let code = wire
            .as_ref()
            .and_then(|w| w.error_code.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        if code == MUTATION_DURING_PAGINATION {
            return ProviderError::PaginationInvalidated;
        }

        let message = wire
            .and_then(|w| w.error_message)
            .unwrap_or_else(|| body.to_string());

        ProviderError::Api {
            status,
            code,
            message,
        }
    }
}

#[async_trait]
impl FeedProvider for HttpFeedProvider {
    #[tracing::instrument(skip(self, credential, cursor), fields(has_cursor = cursor.is_some()))]
    async fn fetch_page(
        &self,
        credential: &str,
        cursor: Option<&str>,
    ) -> Result<FeedPage, ProviderError> {
        let timer = Instant::now();
        let url = format!(
            "{}/transactions/sync",
            self.config.base_url.trim_end_matches('/')
        );

        let request = SyncRequest {
            client_id: &self.config.client_id,
            secret: self.config.secret.expose_secret(),
            access_token: credential,
            cursor,
            count: self.config.page_size,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        PROVIDER_REQUEST_DURATION
            .with_label_values(&["transactions_sync"])
            .observe(timer.elapsed().as_secs_f64());

        if !status.is_success() {
            let err = Self::decode_error(status.as_u16(), &body);
            PROVIDER_PAGES_TOTAL.with_label_values(&["error"]).inc();
            tracing::warn!(status = %status, error = %err, "Feed provider page request failed");
            return Err(err);
        }

        let page: SyncResponse = serde_json::from_str(&body)?;
        PROVIDER_PAGES_TOTAL.with_label_values(&["ok"]).inc();

        tracing::debug!(
            added = page.added.len(),
            modified = page.modified.len(),
            removed = page.removed.len(),
            has_more = page.has_more,
            "Feed page received"
        );

        Ok(page.into())
    }
}

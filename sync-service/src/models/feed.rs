//! Provider-neutral shape of the upstream transaction feed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One transaction as delivered by the feed, before classification.
///
/// `amount` is signed the way the provider signs it: positive is money
/// leaving the account, negative is money arriving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    /// Hierarchical category path, most general first.
    #[serde(default)]
    pub category: Option<Vec<String>>,
    #[serde(default)]
    pub category_primary: Option<String>,
    #[serde(default)]
    pub category_detailed: Option<String>,
    /// Source-specific direction tag such as `credit` or `debit`.
    #[serde(default)]
    pub polarity_hint: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedRecord {
    pub id: String,
}

/// A single page returned by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedPage {
    pub added: Vec<FeedRecord>,
    pub modified: Vec<FeedRecord>,
    pub removed: Vec<RemovedRecord>,
    pub next_cursor: String,
    pub has_more: bool,
}

/// Everything accumulated by one complete fetch loop.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub added: Vec<FeedRecord>,
    pub modified: Vec<FeedRecord>,
    pub removed: Vec<RemovedRecord>,
    pub next_cursor: String,
    /// True when the page ceiling stopped the loop before the feed was drained.
    pub has_more: bool,
    pub pages: u32,
}

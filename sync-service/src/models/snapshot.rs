//! Canonical ledger records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Polarity of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnType {
    Expense,
    Income,
}

impl TxnType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expense => "expense",
            Self::Income => "income",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "expense" => Some(Self::Expense),
            "income" => Some(Self::Income),
            _ => None,
        }
    }
}

impl std::fmt::Display for TxnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One canonical record per upstream transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub id: String,
    pub principal_id: Uuid,
    pub source_item_id: String,
    pub date: NaiveDate,
    #[serde(rename = "type")]
    pub txn_type: TxnType,
    /// Non-negative magnitude.
    pub amount: Decimal,
    pub category: String,
    pub pending: bool,
    pub currency: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A tracked provider connection and its resumption point.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub item_id: String,
    pub principal_id: Uuid,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SourceItem {
    pub fn new(principal_id: Uuid, item_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            principal_id,
            access_token: access_token.into(),
            cursor: None,
            last_synced_at: None,
        }
    }
}

impl std::fmt::Debug for SourceItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceItem")
            .field("item_id", &self.item_id)
            .field("principal_id", &self.principal_id)
            .field("access_token", &"[REDACTED]")
            .field("cursor", &self.cursor)
            .field("last_synced_at", &self.last_synced_at)
            .finish()
    }
}

//! Period/category aggregates and the idempotency records guarding them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TxnType;

/// How dates are grouped into period keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Monthly,
    Weekly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Weekly => "weekly",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}

/// Which counter of a bucket an increment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupField {
    ExpenseTotal,
    IncomeTotal,
}

impl RollupField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpenseTotal => "expense_total",
            Self::IncomeTotal => "income_total",
        }
    }
}

impl From<TxnType> for RollupField {
    fn from(value: TxnType) -> Self {
        match value {
            TxnType::Expense => Self::ExpenseTotal,
            TxnType::Income => Self::IncomeTotal,
        }
    }
}

/// Period × category aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub principal_id: Uuid,
    pub period_key: String,
    pub category_id: String,
    pub category: String,
    pub expense_total: Decimal,
    pub income_total: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Period-wide aggregate across all categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub principal_id: Uuid,
    pub period_key: String,
    pub expense_total: Decimal,
    pub income_total: Decimal,
    pub net: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Applied,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Idempotency record for one caller-supplied mutation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub principal_id: Uuid,
    pub mutation_id: String,
    pub status: MutationStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Result returned to the caller that applied it; replayed verbatim.
    pub result: Option<ApplyResult>,
}

impl MutationRecord {
    pub fn pending(principal_id: Uuid, mutation_id: impl Into<String>) -> Self {
        Self {
            principal_id,
            mutation_id: mutation_id.into(),
            status: MutationStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
            error: None,
            result: None,
        }
    }
}

/// Outcome for one delta of an apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaResult {
    pub index: usize,
    pub ok: bool,
    /// Contributions of this delta that made it into the batch.
    pub applied_contributions: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub results: Vec<DeltaResult>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
}

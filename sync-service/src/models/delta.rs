//! Net-change records handed from the ledger writer to the rollup aggregator.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TxnType;

/// Fields one delta contributes to a bucket.
///
/// Externally supplied deltas are read leniently: a missing or malformed
/// field rejects that one contribution instead of failing the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDeltaFields")]
pub struct DeltaFields {
    pub date: Option<NaiveDate>,
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub txn_type: Option<TxnType>,
    pub amount: Decimal,
    /// First value that could not be read, if any.
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl DeltaFields {
    pub fn new(
        date: NaiveDate,
        category: impl Into<String>,
        txn_type: TxnType,
        amount: Decimal,
    ) -> Self {
        Self {
            date: Some(date),
            category: Some(category.into()),
            txn_type: Some(txn_type),
            amount,
            malformed: None,
        }
    }
}

#[derive(Deserialize)]
struct RawDeltaFields {
    #[serde(default)]
    date: Option<Value>,
    #[serde(default)]
    category: Option<Value>,
    #[serde(rename = "type", default)]
    txn_type: Option<Value>,
    #[serde(default)]
    amount: Option<Value>,
}

fn read_field<T: DeserializeOwned>(
    value: Option<Value>,
    name: &str,
    malformed: &mut Option<String>,
) -> Option<T> {
    match serde_json::from_value(value?) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            malformed.get_or_insert_with(|| format!("invalid {name}"));
            None
        }
    }
}

impl From<RawDeltaFields> for DeltaFields {
    fn from(raw: RawDeltaFields) -> Self {
        let mut malformed = None;
        let date = read_field(raw.date, "date", &mut malformed);
        let category = read_field(raw.category, "category", &mut malformed);
        let txn_type = read_field(raw.txn_type, "type", &mut malformed);
        let amount: Option<Decimal> = match raw.amount {
            Some(value) => read_field(Some(value), "amount", &mut malformed),
            None => {
                malformed.get_or_insert_with(|| "missing amount".to_string());
                None
            }
        };
        Self {
            date,
            category,
            txn_type,
            amount: amount.unwrap_or_default(),
            malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Delta {
    Add(DeltaFields),
    Update { prev: DeltaFields, next: DeltaFields },
    Delete(DeltaFields),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Add,
    Update,
    Delete,
}

impl DeltaOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl Delta {
    pub fn op(&self) -> DeltaOp {
        match self {
            Delta::Add(_) => DeltaOp::Add,
            Delta::Update { .. } => DeltaOp::Update,
            Delta::Delete(_) => DeltaOp::Delete,
        }
    }

    /// Signed contributions this delta makes: `(+1, fields)` or `(-1, fields)`.
    pub fn contributions(&self) -> Vec<(i8, &DeltaFields)> {
        match self {
            Delta::Add(fields) => vec![(1, fields)],
            Delta::Delete(fields) => vec![(-1, fields)],
            Delta::Update { prev, next } => vec![(-1, prev), (1, next)],
        }
    }
}

/// Signed income/expense totals folded from a list of deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub income: Decimal,
    pub expense: Decimal,
}

//! Maps raw feed records onto canonical `{type, amount, category}`.
//!
//! Everything provider-specific about polarity and categories is decided
//! here and nowhere else.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{DeltaFields, FeedRecord, TransactionSnapshot, TxnType};

pub const UNCATEGORIZED: &str = "Uncategorized";

const INCOME_HINTS: &[&str] = &["credit", "income", "inflow"];
const INCOME_KEYWORDS: &[&str] = &["payroll", "salary", "refund", "deposit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub txn_type: TxnType,
    pub amount: Decimal,
}

/// Canonical view used for diffing and aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalTxn {
    pub date: NaiveDate,
    pub category: String,
    pub txn_type: TxnType,
    pub amount: Decimal,
}

impl CanonicalTxn {
    pub fn to_fields(&self) -> DeltaFields {
        DeltaFields::new(self.date, self.category.clone(), self.txn_type, self.amount)
    }
}

impl From<&TransactionSnapshot> for CanonicalTxn {
    fn from(snapshot: &TransactionSnapshot) -> Self {
        Self {
            date: snapshot.date,
            category: snapshot.category.clone(),
            txn_type: snapshot.txn_type,
            amount: snapshot.amount,
        }
    }
}

/// Decide polarity and magnitude.
///
/// Priority: explicit polarity hint, then negative signed amount, then
/// income keywords in the category metadata. Anything else is an expense.
pub fn classify(record: &FeedRecord) -> Classification {
    let income = has_income_hint(record)
        || record.amount.is_sign_negative() && !record.amount.is_zero()
        || has_income_keyword(record);

    Classification {
        txn_type: if income {
            TxnType::Income
        } else {
            TxnType::Expense
        },
        amount: record.amount.abs(),
    }
}

/// First element of the category path, else the primary category, else
/// [`UNCATEGORIZED`]. Blank strings count as absent.
pub fn category_from(record: &FeedRecord) -> String {
    record
        .category
        .as_ref()
        .and_then(|path| path.first())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            record
                .category_primary
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or(UNCATEGORIZED)
        .to_string()
}

pub fn canonicalize(record: &FeedRecord) -> CanonicalTxn {
    let Classification { txn_type, amount } = classify(record);
    CanonicalTxn {
        date: record.date,
        category: category_from(record),
        txn_type,
        amount,
    }
}

fn has_income_hint(record: &FeedRecord) -> bool {
    record
        .polarity_hint
        .as_deref()
        .map(|hint| {
            let hint = hint.trim().to_ascii_lowercase();
            INCOME_HINTS.contains(&hint.as_str())
        })
        .unwrap_or(false)
}

fn has_income_keyword(record: &FeedRecord) -> bool {
    let path = record.category.iter().flatten().map(String::as_str);
    let singles = [
        record.category_primary.as_deref(),
        record.category_detailed.as_deref(),
    ];

    path.chain(singles.into_iter().flatten()).any(|text| {
        let text = text.to_ascii_lowercase();
        INCOME_KEYWORDS.iter().any(|kw| text.contains(kw))
    })
}

//! Turns add/modify/remove batches into `Delta` records.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::models::{
    Delta, DeltaFields, DeltaSummary, FeedRecord, RemovedRecord, TransactionSnapshot, TxnType,
};
use crate::services::classifier::{canonicalize, CanonicalTxn};

/// One `add` per record.
pub fn build_add_deltas(added: &[FeedRecord]) -> Vec<Delta> {
    added
        .iter()
        .map(|record| Delta::Add(canonicalize(record).to_fields()))
        .collect()
}

/// Diff modified records against their prior snapshots.
///
/// A modification without a known baseline is treated as a first sighting
/// and becomes an `add`. Records whose canonical fields did not change
/// produce nothing.
pub fn build_modified_deltas(
    modified: &[FeedRecord],
    prior_by_id: &HashMap<String, TransactionSnapshot>,
) -> Vec<Delta> {
    modified
        .iter()
        .filter_map(|record| {
            let next = canonicalize(record);
            match prior_by_id.get(&record.id) {
                None => Some(Delta::Add(next.to_fields())),
                Some(snapshot) => {
                    let prev = CanonicalTxn::from(snapshot);
                    (prev != next).then(|| Delta::Update {
                        prev: prev.to_fields(),
                        next: next.to_fields(),
                    })
                }
            }
        })
        .collect()
}

/// One `delete` per removed id that has a prior snapshot; unknown ids have
/// nothing to reverse and are skipped.
pub fn build_removed_deltas(
    removed: &[RemovedRecord],
    prior_by_id: &HashMap<String, TransactionSnapshot>,
) -> Vec<Delta> {
    removed
        .iter()
        .filter_map(|r| prior_by_id.get(&r.id))
        .map(|snapshot| Delta::Delete(CanonicalTxn::from(snapshot).to_fields()))
        .collect()
}

/// Fold deltas into signed income/expense totals.
///
/// Reporting and verification aid; rollups are never computed from this.
pub fn summarize(deltas: &[Delta]) -> DeltaSummary {
    let mut summary = DeltaSummary::default();
    for delta in deltas {
        for (sign, fields) in delta.contributions() {
            fold(&mut summary, sign, fields);
        }
    }
    summary
}

fn fold(summary: &mut DeltaSummary, sign: i8, fields: &DeltaFields) {
    let signed = Decimal::from(sign) * fields.amount;
    match fields.txn_type {
        Some(TxnType::Income) => summary.income += signed,
        Some(TxnType::Expense) => summary.expense += signed,
        None => {}
    }
}

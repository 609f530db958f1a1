//! Idempotent period × category aggregation of deltas.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{StoreError, SyncError};
use crate::models::{
    ApplyResult, Delta, DeltaFields, DeltaResult, Granularity, MutationRecord, MutationStatus,
    RollupField,
};
use crate::services::classifier::UNCATEGORIZED;
use crate::services::metrics::ROLLUP_APPLY_TOTAL;
use crate::services::store::{LedgerStore, WriteBatch};

/// `YYYY-MM` for monthly, ISO week `YYYY-Www` for weekly.
pub fn period_key(date: NaiveDate, granularity: Granularity) -> String {
    match granularity {
        Granularity::Monthly => date.format("%Y-%m").to_string(),
        Granularity::Weekly => {
            let week = date.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
    }
}

/// Storage-safe bucket id for a category name.
pub fn category_id(category: &str) -> String {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        return UNCATEGORIZED.to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A validated, signed contribution to one bucket.
struct Contribution {
    period_key: String,
    category_id: String,
    category: String,
    field: RollupField,
    amount: Decimal,
}

fn validate(sign: i8, fields: &DeltaFields, granularity: Granularity) -> Result<Contribution, String> {
    if let Some(reason) = &fields.malformed {
        return Err(reason.clone());
    }
    let date = fields.date.ok_or("missing date")?;
    let category = fields
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or("missing category")?;
    let txn_type = fields.txn_type.ok_or("missing type")?;
    if fields.amount < Decimal::ZERO {
        return Err("amount must be non-negative".to_string());
    }

    Ok(Contribution {
        period_key: period_key(date, granularity),
        category_id: category_id(category),
        category: category.to_string(),
        field: txn_type.into(),
        amount: Decimal::from(sign) * fields.amount,
    })
}

/// Summed increments for one call, keyed so the batch is deterministic.
#[derive(Default)]
struct Plan {
    results: Vec<DeltaResult>,
    buckets: BTreeMap<(String, String, RollupFieldKey), (String, Decimal)>,
    summaries: BTreeMap<(String, RollupFieldKey), Decimal>,
}

/// `RollupField` ordered for use in map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RollupFieldKey {
    Expense,
    Income,
}

impl From<RollupField> for RollupFieldKey {
    fn from(field: RollupField) -> Self {
        match field {
            RollupField::ExpenseTotal => Self::Expense,
            RollupField::IncomeTotal => Self::Income,
        }
    }
}

impl From<RollupFieldKey> for RollupField {
    fn from(key: RollupFieldKey) -> Self {
        match key {
            RollupFieldKey::Expense => Self::ExpenseTotal,
            RollupFieldKey::Income => Self::IncomeTotal,
        }
    }
}

fn plan(deltas: &[Delta], granularity: Granularity) -> Plan {
    let mut plan = Plan::default();

    for (index, delta) in deltas.iter().enumerate() {
        let contributions = delta.contributions();
        let labelled = contributions.len() > 1;
        let mut result = DeltaResult {
            index,
            ok: true,
            applied_contributions: 0,
            errors: Vec::new(),
        };

        for (position, (sign, fields)) in contributions.into_iter().enumerate() {
            match validate(sign, fields, granularity) {
                Ok(c) => {
                    let field = RollupFieldKey::from(c.field);
                    let bucket = plan
                        .buckets
                        .entry((c.period_key.clone(), c.category_id, field))
                        .or_insert_with(|| (c.category, Decimal::ZERO));
                    bucket.1 += c.amount;
                    *plan
                        .summaries
                        .entry((c.period_key, field))
                        .or_insert(Decimal::ZERO) += c.amount;
                    result.applied_contributions += 1;
                }
                Err(reason) => {
                    result.ok = false;
                    result.errors.push(if labelled {
                        let side = if position == 0 { "prev" } else { "next" };
                        format!("{}: {}", side, reason)
                    } else {
                        reason
                    });
                }
            }
        }

        plan.results.push(result);
    }

    plan
}

pub struct RollupAggregator<S: ?Sized> {
    store: Arc<S>,
}

impl<S: LedgerStore + ?Sized> RollupAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Apply a batch of deltas to the principal's rollups.
    ///
    /// With a `mutation_id`, a batch that was already applied returns its
    /// stored result and changes nothing. Invalid contributions are reported
    /// per delta and skipped; all valid ones are committed in one batch
    /// together with the mutation's transition to `applied`.
    #[instrument(skip(self, deltas), fields(principal_id = %principal_id, delta_count = deltas.len(), granularity = granularity.as_str()))]
    pub async fn apply(
        &self,
        principal_id: Uuid,
        deltas: &[Delta],
        granularity: Granularity,
        mutation_id: Option<&str>,
    ) -> Result<ApplyResult, SyncError> {
        if let Some(id) = mutation_id {
            let existing = self
                .store
                .get_mutation(principal_id, id)
                .await
                .map_err(SyncError::Store)?;
            if let Some(record) = existing.filter(|m| m.status == MutationStatus::Applied) {
                return Ok(self.replay(record));
            }

            let record = self
                .store
                .begin_mutation(principal_id, id)
                .await
                .map_err(SyncError::Store)?;
            if record.status == MutationStatus::Applied {
                return Ok(self.replay(record));
            }
        }

        let Plan {
            results,
            buckets,
            summaries,
        } = plan(deltas, granularity);

        let result = ApplyResult {
            results,
            applied: true,
            mutation_id: mutation_id.map(str::to_string),
        };

        let mut batch = WriteBatch::new();
        for ((period, cat_id, field), (category, amount)) in buckets {
            batch.increment_rollup(principal_id, period, cat_id, category, field.into(), amount);
        }
        for ((period, field), amount) in summaries {
            batch.increment_summary(principal_id, period, field.into(), amount);
        }
        if let Some(id) = mutation_id {
            batch.claim_mutation(principal_id, id, result.clone());
        }

        if batch.is_empty() {
            ROLLUP_APPLY_TOTAL.with_label_values(&["applied"]).inc();
            return Ok(result);
        }

        match self.store.commit(batch).await {
            Ok(()) => {
                ROLLUP_APPLY_TOTAL.with_label_values(&["applied"]).inc();
                let rejected = result.results.iter().filter(|r| !r.ok).count();
                info!(rejected, "Rollup batch applied");
                Ok(result)
            }
            Err(StoreError::AlreadyApplied(id)) => {
                // A concurrent call with the same id won the claim.
                let record = self
                    .store
                    .get_mutation(principal_id, &id)
                    .await
                    .map_err(SyncError::Store)?;
                match record {
                    Some(record) => Ok(self.replay(record)),
                    None => Err(SyncError::Commit(StoreError::AlreadyApplied(id))),
                }
            }
            Err(e) => {
                ROLLUP_APPLY_TOTAL.with_label_values(&["failed"]).inc();
                if let Some(id) = mutation_id {
                    if let Err(mark_err) = self
                        .store
                        .fail_mutation(principal_id, id, &e.to_string())
                        .await
                    {
                        warn!(error = %mark_err, mutation_id = %id, "Failed to mark mutation failed");
                    }
                }
                Err(SyncError::Commit(e))
            }
        }
    }

    fn replay(&self, record: MutationRecord) -> ApplyResult {
        ROLLUP_APPLY_TOTAL.with_label_values(&["replayed"]).inc();
        info!(mutation_id = %record.mutation_id, "Mutation already applied, returning stored result");
        record.result.unwrap_or(ApplyResult {
            results: Vec::new(),
            applied: true,
            mutation_id: Some(record.mutation_id),
        })
    }
}

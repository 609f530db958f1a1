//! Inputs and results of a sync run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::Delta;

/// Inclusive date window that added/modified records must fall in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncScope {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl SyncScope {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && self.end.map_or(true, |end| date <= end)
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        }
    }
}

/// Result of syncing a single source item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSyncResult {
    pub item_id: String,
    pub written: usize,
    pub removed: usize,
    pub new_cursor: String,
    /// The page ceiling stopped this sync; another run will continue it.
    pub has_more: bool,
    pub deltas: Vec<Delta>,
}

/// Partial-success report for a principal-wide sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub items_processed: usize,
    pub items_failed: usize,
    pub transactions_written: usize,
    pub transactions_removed: usize,
    pub last_cursor: Option<String>,
    pub delta_count: usize,
    pub rollup_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollup_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<String>,
}

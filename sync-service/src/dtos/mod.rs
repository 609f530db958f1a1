//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Delta, Granularity, PeriodSummary, RollupBucket, SyncScope};

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SyncRequest {
    #[serde(default)]
    pub scope: Option<SyncScope>,
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[validate(length(min = 1, max = 255, message = "mutation_id must be 1-255 characters"))]
    #[serde(default)]
    pub mutation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ItemSyncRequest {
    #[serde(default)]
    pub scope: Option<SyncScope>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplyRollupsRequest {
    #[validate(length(max = 5000, message = "at most 5000 deltas per request"))]
    pub deltas: Vec<Delta>,
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[validate(length(min = 1, max = 255, message = "mutation_id must be 1-255 characters"))]
    #[serde(default)]
    pub mutation_id: Option<String>,
}

/// A period's summary plus its category buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupPeriodResponse {
    pub principal_id: Uuid,
    pub period_key: String,
    pub summary: Option<PeriodSummary>,
    pub buckets: Vec<RollupBucket>,
}

//! HTTP handlers for sync-service.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{ApplyRollupsRequest, ItemSyncRequest, RollupPeriodResponse, SyncRequest};
use crate::models::{ApplyResult, ItemSyncResult, SyncSummary};
use crate::services::get_metrics;
use crate::startup::AppState;

/// Health check endpoint for Docker/K8s liveness probes.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "sync-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint for K8s readiness probes.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(db) = &state.db {
        if let Err(e) = db.health_check().await {
            tracing::warn!(error = %e, "Readiness check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "database": "unreachable" })),
            );
        }
    }
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

/// Prometheus metrics endpoint.
pub async fn metrics_endpoint() -> impl IntoResponse {
    let mut body = get_metrics();
    body.push_str(&service_core::observability::metrics::render());
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

/// Sync every tracked source item of a principal and aggregate the deltas.
pub async fn sync_principal(
    State(state): State<AppState>,
    Path(principal_id): Path<Uuid>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncSummary>, AppError> {
    payload.validate()?;

    tracing::info!(principal_id = %principal_id, "Starting principal sync");

    let summary = state
        .sync
        .sync_principal(
            principal_id,
            payload.scope.as_ref(),
            payload.granularity,
            payload.mutation_id,
        )
        .await?;

    Ok(Json(summary))
}

/// Sync one source item. Its deltas are returned to the caller unapplied.
pub async fn sync_item(
    State(state): State<AppState>,
    Path((principal_id, item_id)): Path<(Uuid, String)>,
    Json(payload): Json<ItemSyncRequest>,
) -> Result<Json<ItemSyncResult>, AppError> {
    payload.validate()?;

    tracing::info!(principal_id = %principal_id, item_id = %item_id, "Starting item sync");

    let result = state
        .sync
        .sync_item(principal_id, &item_id, payload.scope.as_ref())
        .await?;

    Ok(Json(result))
}

/// Apply caller-supplied deltas to the principal's rollups.
pub async fn apply_rollups(
    State(state): State<AppState>,
    Path(principal_id): Path<Uuid>,
    Json(payload): Json<ApplyRollupsRequest>,
) -> Result<Json<ApplyResult>, AppError> {
    payload.validate()?;

    tracing::info!(
        principal_id = %principal_id,
        deltas = payload.deltas.len(),
        mutation_id = ?payload.mutation_id,
        "Applying rollup deltas"
    );

    let result = state
        .sync
        .apply_rollups(
            principal_id,
            &payload.deltas,
            payload.granularity,
            payload.mutation_id.as_deref(),
        )
        .await?;

    Ok(Json(result))
}

/// Period summary and category buckets for one period key.
pub async fn get_rollups(
    State(state): State<AppState>,
    Path((principal_id, period_key)): Path<(Uuid, String)>,
) -> Result<Json<RollupPeriodResponse>, AppError> {
    let store = state.sync.store();

    let summary = store
        .get_period_summary(principal_id, &period_key)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
    let buckets = store
        .list_rollups(principal_id, &period_key)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;

    if summary.is_none() && buckets.is_empty() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "No rollups for period '{}'",
            period_key
        )));
    }

    Ok(Json(RollupPeriodResponse {
        principal_id,
        period_key,
        summary,
        buckets,
    }))
}

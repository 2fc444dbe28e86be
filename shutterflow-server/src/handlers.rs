//! HTTP handlers for the pipeline control surface.
//!
//! Every mutating endpoint maps onto one core operation; the handlers
//! translate path/query input and pass the core's reports back as JSON.

use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use shutterflow_core::catalog::{BatchRecord, BatchStatus, FileRecord};
use shutterflow_core::pipeline::{Overview, PipelineStatus, RetryOutcome};
use shutterflow_core::stages::{
    BatchOutcome, CleanupReport, DedupSnapshot, RefreshSummary, SortReport, SyncStart,
};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

/// Liveness probe; fails when the catalog database is unreachable.
pub async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    state.catalog.ping().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Kicks off a background dedup run. `started` is false when a run is
/// already in flight.
pub async fn run_dedup(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let started = state.pipeline.dedup().spawn();
    (StatusCode::ACCEPTED, Json(json!({ "started": started })))
}

pub async fn dedup_status(State(state): State<AppState>) -> Json<DedupSnapshot> {
    Json(state.pipeline.dedup().status().await)
}

pub async fn create_batch(State(state): State<AppState>) -> AppResult<Json<BatchOutcome>> {
    let outcome = state.pipeline.batch().create().await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ListBatchesQuery {
    /// Filter to one batch status, e.g. `SYNCING`.
    pub status: Option<String>,
    /// Return only the most recent N batches.
    pub limit: Option<i64>,
}

pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListBatchesQuery>,
) -> AppResult<Json<Vec<BatchRecord>>> {
    let store = state.catalog.batches();
    let batches = match (&query.status, query.limit) {
        (Some(raw), _) => {
            let status = BatchStatus::from_str(raw)
                .map_err(|_| AppError::bad_request(format!("unknown batch status {raw:?}")))?;
            store.list_with_status(status).await?
        }
        (None, Some(limit)) => store.recent(limit).await?,
        (None, None) => store.list().await?,
    };
    Ok(Json(batches))
}

#[derive(Debug, Serialize)]
pub struct BatchDetail {
    pub batch: BatchRecord,
    pub files: Vec<FileRecord>,
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<BatchDetail>> {
    let batch = state
        .catalog
        .batches()
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("batch {id} not found")))?;
    let files = state.catalog.files().list_for_batch(id).await?;
    Ok(Json(BatchDetail { batch, files }))
}

pub async fn retry_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<RetryOutcome>> {
    let outcome = state.pipeline.retry_batch(id).await?;
    Ok(Json(outcome))
}

pub async fn start_sync(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<SyncStart>> {
    Ok(Json(state.pipeline.sync().start(id).await?))
}

/// One completion poll against the replication service; returns the
/// refreshed batch row.
pub async fn sync_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<BatchRecord>> {
    Ok(Json(state.pipeline.sync().poll(id).await?))
}

pub async fn refresh_sync(State(state): State<AppState>) -> AppResult<Json<RefreshSummary>> {
    Ok(Json(state.pipeline.sync().refresh_all().await?))
}

pub async fn sort_batch(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<SortReport>> {
    Ok(Json(state.pipeline.sort().sort_batch(id).await?))
}

pub async fn run_cleanup(State(state): State<AppState>) -> AppResult<Json<CleanupReport>> {
    Ok(Json(state.pipeline.cleanup().run().await?))
}

/// Triggers a full cycle in the background. `started` is false when a
/// cycle already holds the single-flight gate.
pub async fn run_pipeline(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let started = state.pipeline.trigger().await;
    (StatusCode::ACCEPTED, Json(json!({ "started": started })))
}

pub async fn pipeline_status(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.pipeline.status().await)
}

pub async fn overview(State(state): State<AppState>) -> AppResult<Json<Overview>> {
    Ok(Json(state.pipeline.overview().await?))
}

//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::housekeeping;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/suspicious", get(list_suspicious))
        .route("/suspicious/{id}/resolve", post(resolve_suspicious))
        .route("/blocked", get(list_blocked))
        .route("/detect", post(run_detection))
        .route("/report", get(security_report))
        .route("/schedules", get(list_schedules))
}

/// Run a blocking storage call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_suspicious(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let ledger = state.ledger.clone();
    let records = blocking(move || ledger.list_recent(limit)).await?;
    Ok(Json(json!({
        "data": records,
        "meta": { "total": records.len() }
    })))
}

async fn resolve_suspicious(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let ledger = state.ledger.clone();
    if !blocking(move || ledger.mark_resolved(id)).await? {
        return Err(ApiError::NotFound(format!("suspicious record {} not found", id)));
    }
    Ok(Json(json!({ "data": { "id": id, "resolved": true }, "meta": meta() })))
}

async fn list_blocked(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let denylist = state.denylist.clone();
    let records = blocking(move || denylist.list_active()).await?;
    Ok(Json(json!({
        "data": records,
        "meta": { "total": records.len() }
    })))
}

async fn run_detection(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let summary = state.engine.run().await?;
    Ok(Json(json!({ "data": summary, "meta": meta() })))
}

async fn security_report(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let report =
        blocking(move || housekeeping::generate_security_report(&pool, Utc::now())).await?;
    Ok(Json(json!({ "data": report, "meta": meta() })))
}

async fn list_schedules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let scheduler = state.scheduler.clone();
    let schedules = blocking(move || scheduler.list()).await?;
    Ok(Json(json!({
        "data": schedules,
        "meta": { "total": schedules.len() }
    })))
}

//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::scheduler::{JobPatch, NewJob};

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{key}", get(get_job).patch(update_job).delete(delete_job))
        .route("/jobs/{key}/enable", post(enable_job))
        .route("/jobs/{key}/disable", post(disable_job))
        .route("/jobs/{key}/runs", get(list_runs))
        .route("/runs", get(list_recent_runs))
        .route("/schedules/dry-run", get(schedule_dry_run))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let status = state.scheduler.status()?;
    Ok(Json(json!({
        "data": {
            "status": if status.running { "ok" } else { "stopped" },
            "scheduler": status,
        },
        "meta": meta()
    })))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    enabled_only: bool,
}

async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> ApiResult {
    let jobs = state.scheduler.list_jobs(params.enabled_only)?;
    let total = jobs.len();
    Ok(Json(json!({ "data": jobs, "meta": { "total": total } })))
}

async fn create_job(
    State(state): State<AppState>,
    Json(new): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = state.scheduler.create_job(new)?;
    tracing::info!(job = %job.key, schedule = %job.schedule, "Job created");
    Ok((StatusCode::CREATED, Json(json!({ "data": job, "meta": meta() }))))
}

async fn get_job(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    let job = state.scheduler.get_job(&key)?;
    Ok(Json(json!({ "data": job, "meta": meta() })))
}

async fn update_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(patch): Json<JobPatch>,
) -> ApiResult {
    let job = state.scheduler.update_job(&key, &patch)?;
    tracing::info!(job = %job.key, schedule = %job.schedule, "Job updated");
    Ok(Json(json!({ "data": job, "meta": meta() })))
}

async fn delete_job(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    state.scheduler.delete_job(&key)?;
    tracing::info!(job = %key, "Job deleted");
    Ok(Json(json!({ "data": { "key": key, "deleted": true }, "meta": meta() })))
}

async fn enable_job(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    state.scheduler.enable_job(&key)?;
    let job = state.scheduler.get_job(&key)?;
    Ok(Json(json!({ "data": job, "meta": meta() })))
}

async fn disable_job(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    state.scheduler.disable_job(&key)?;
    let job = state.scheduler.get_job(&key)?;
    Ok(Json(json!({ "data": job, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn list_runs(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RunsParams>,
) -> ApiResult {
    // Distinguish "no runs yet" from "no such job".
    state.scheduler.get_job(&key)?;
    let runs = state.scheduler.list_run_records(&key, params.limit.min(1000))?;
    let total = runs.len();
    Ok(Json(json!({ "data": runs, "meta": { "total": total } })))
}

#[derive(Debug, Deserialize)]
struct RecentRunsParams {
    job: Option<String>,
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    50
}

async fn list_recent_runs(State(state): State<AppState>, Query(params): Query<RecentRunsParams>) -> ApiResult {
    let runs = state
        .scheduler
        .list_recent_runs(params.job.as_deref(), params.limit.min(1000))?;
    let total = runs.len();
    Ok(Json(json!({ "data": runs, "meta": { "total": total } })))
}

#[derive(Debug, Deserialize)]
struct DryRunParams {
    #[serde(default = "default_hours")]
    hours: u64,
}

fn default_hours() -> u64 {
    24
}

async fn schedule_dry_run(State(state): State<AppState>, Query(params): Query<DryRunParams>) -> ApiResult {
    let upcoming = state.scheduler.preview(params.hours)?;
    Ok(Json(json!({
        "data": { "upcoming": upcoming },
        "meta": { "hours": params.hours, "total": upcoming.len() }
    })))
}

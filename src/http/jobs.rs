//! Endpoint handlers for `/api/jobs`.

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::auth::AuthUser;
use super::error::ApiError;
use super::AppState;
use crate::models::{CreateJobRequest, Job, JobWithTasks, Page, UpdateJobRequest};

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    workspace_id: Uuid,
    page: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TaskPageQuery {
    task_page: Option<i64>,
    task_limit: Option<i64>,
}

pub(super) async fn create_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.jobs.create_job(req, user.id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub(super) async fn list_jobs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<Job>>, ApiError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(state.default_limit);
    let jobs = state
        .jobs
        .get_jobs(user.id, query.workspace_id, page, limit)
        .await?;
    Ok(Json(jobs))
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(query): Query<TaskPageQuery>,
) -> Result<Json<JobWithTasks>, ApiError> {
    let page = query.task_page.unwrap_or(1);
    let limit = query.task_limit.unwrap_or(state.default_limit);
    let job = state.jobs.get_job(id, user.id, page, limit).await?;
    Ok(Json(job))
}

pub(super) async fn update_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<Json<Job>, ApiError> {
    let job = state.jobs.update_job(id, user.id, req).await?;
    Ok(Json(job))
}

pub(super) async fn delete_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.jobs.delete_job(id, user.id).await?;
    Ok(Json(json!({ "message": "Job deleted successfully" })))
}

pub(super) async fn pause_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.jobs.pause_job(id, user.id).await?;
    Ok(Json(json!({ "message": "Job paused successfully" })))
}

pub(super) async fn resume_job(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.jobs.resume_job(id, user.id).await?;
    Ok(Json(json!({ "message": "Job resumed successfully" })))
}

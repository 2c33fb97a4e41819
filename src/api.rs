use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tracing::debug;

use crate::{
    error::AppError,
    helpers,
    jobs::transcode::{JobForm, TranscodeJob},
    services::job::{JobRow, JobsService},
};

pub fn router(jobs: Arc<JobsService>) -> Router {
    Router::new()
        .route("/queue", post(add_to_queue))
        .route("/jobs", get(get_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/start", post(start_queue))
        .route("/status", get(get_status))
        .fallback(helpers::handler_404)
        .layer(Extension(jobs))
}

#[axum_macros::debug_handler]
async fn add_to_queue(
    Extension(jobs): Extension<Arc<JobsService>>,
    form: Result<Json<JobForm>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(form) = form?;
    let job = TranscodeJob::from_form(&jobs.state().settings.ffmpeg, &form)?;
    let command = job.command().to_string();
    debug!("queueing {}", command);

    let (typ, id) = jobs.enqueue(job).await?;

    Ok(Json(json!({
        "job_type": typ,
        "job_id": id,
        "command": command,
    })))
}

async fn get_jobs(
    Extension(jobs): Extension<Arc<JobsService>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let list: Vec<serde_json::Value> = jobs.list().await?.iter().map(row_json).collect();
    Ok(Json(json!(list)))
}

async fn get_job(
    Extension(jobs): Extension<Arc<JobsService>>,
    Path(id): Path<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = jobs.get(id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(row_json(&row)))
}

fn row_json(row: &JobRow) -> serde_json::Value {
    let output = row
        .output
        .as_deref()
        .and_then(|o| serde_json::from_str::<serde_json::Value>(o).ok());
    json!({
        "id": row.id,
        "job_type": row.job_type,
        "state": row.state,
        "scheduled": row.scheduled,
        "active": row.active,
        "completed": row.completed,
        "command": row.describe(),
        "output": output,
    })
}

async fn start_queue(
    Extension(jobs): Extension<Arc<JobsService>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = jobs.status().await?;
    jobs.start();
    Ok(Json(json!({ "status": status.to_string() })))
}

async fn get_status(
    Extension(jobs): Extension<Arc<JobsService>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = jobs.status().await?;
    Ok(Json(json!({
        "status": status.to_string(),
        "detail": status,
    })))
}

//! HTTP control surface for launching and observing export jobs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{ExportError, Result};
use crate::state::{BatchStatus, JobExecution};
use crate::tracker::JobTracker;

/// Query parameters accepted by the launch endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchParams {
    pub where_clause: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub job_id: u64,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: u64,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: String,
    pub exit_description: String,
}

impl From<JobExecution> for JobStatusResponse {
    fn from(record: JobExecution) -> Self {
        Self {
            job_id: record.job_id,
            status: record.status,
            start_time: record.start_time,
            end_time: record.end_time,
            exit_code: record.exit_status.exit_code,
            exit_description: record.exit_status.exit_description,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub job_id: u64,
    pub stopping: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(tracker: Arc<JobTracker>) -> Router {
    Router::new()
        .route("/api/batch/export", post(launch_export))
        .route("/api/batch/job/{job_id}", get(job_status))
        .route("/api/batch/job/{job_id}/stop", post(stop_job))
        .route("/healthz", get(health))
        .with_state(tracker)
}

/// Serve the router on `bind` until `shutdown` is cancelled.
pub async fn serve(
    bind: &str,
    tracker: Arc<JobTracker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = resolve_bind(bind).await?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router(tracker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// First address `bind` resolves to.
pub async fn resolve_bind(bind: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(bind)
        .await
        .map_err(|e| ExportError::Config(format!("invalid bind address '{}': {}", bind, e)))?;
    addrs.next().ok_or_else(|| {
        ExportError::Config(format!("bind address '{}' resolved to nothing", bind))
    })
}

async fn launch_export(
    State(tracker): State<Arc<JobTracker>>,
    Query(params): Query<LaunchParams>,
) -> impl IntoResponse {
    match tracker
        .launch(params.where_clause.as_deref(), params.filename.as_deref())
        .await
    {
        Ok(record) => Json(LaunchResponse {
            job_id: record.job_id,
            status: record.status,
            start_time: record.start_time,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to launch export job: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn job_status(
    State(tracker): State<Arc<JobTracker>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let Ok(job_id) = job_id.parse::<u64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tracker.status(job_id).await {
        Some(record) => Json(JobStatusResponse::from(record)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stop_job(
    State(tracker): State<Arc<JobTracker>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let Ok(job_id) = job_id.parse::<u64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if tracker.status(job_id).await.is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let stopping = tracker.stop(job_id).await;
    let status = if stopping {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(StopResponse { job_id, stopping })).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

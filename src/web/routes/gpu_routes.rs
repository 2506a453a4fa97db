use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::gpu::{CaptureOutcome, LookupSource};
use crate::web::models::gpu_models::{
    CaptureResponse, GpuQuery, JobGpuResponse, OverviewResponse,
};
use crate::web::{AppError, AppState};

// --- Route Handlers ---

async fn get_gpu_handler(
    State(app_state): State<Arc<AppState>>,
    params: Result<Query<GpuQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(params) = params.map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
    match params.job_id {
        Some(job_id) => {
            let job_id = job_id.trim();
            if job_id.is_empty() {
                return Err(AppError::InvalidInput("job_id must not be empty".to_string()));
            }
            let summary = app_state
                .lookup
                .job_summary(job_id, Utc::now())
                .await?
                .ok_or_else(|| AppError::NotFound(format!("No GPU metrics found for job {job_id}")))?;
            Ok(Json(JobGpuResponse {
                status: StatusCode::OK.as_u16(),
                data: summary.into(),
            })
            .into_response())
        }
        None => {
            let to = params.to.unwrap_or_else(Utc::now);
            let from = params.from.unwrap_or(to - Duration::hours(24));
            if from >= to {
                return Err(AppError::InvalidInput(
                    "from must be before to".to_string(),
                ));
            }
            let overview = app_state.lookup.overview(from, to).await?;
            Ok(Json(OverviewResponse {
                status: StatusCode::OK.as_u16(),
                data: overview.into(),
                source: LookupSource::Database,
            })
            .into_response())
        }
    }
}

async fn capture_gpu_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<CaptureResponse>), AppError> {
    match app_state.capture.run(Utc::now()).await? {
        CaptureOutcome::Completed(report) => {
            Ok((StatusCode::OK, Json(CaptureResponse::completed(report))))
        }
        CaptureOutcome::RateLimited { next_capture_in } => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(CaptureResponse::rate_limited(next_capture_in)),
        )),
    }
}

pub fn gpu_router() -> Router<Arc<AppState>> {
    Router::new().route("/api/gpu", get(get_gpu_handler).post(capture_gpu_handler))
}

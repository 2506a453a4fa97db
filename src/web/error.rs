use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::gpu::{CaptureError, LookupError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Integration disabled: {0}")]
    IntegrationDisabled(String),
    #[error("Not configured: {0}")]
    NotConfigured(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Upstream error: {message}")]
    Upstream { message: String, errors: Vec<String> },
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::IntegrationDisabled(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotConfigured(_)
            | AppError::DatabaseError(_)
            | AppError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, errors) = match self {
            AppError::InvalidInput(msg)
            | AppError::IntegrationDisabled(msg)
            | AppError::NotConfigured(msg)
            | AppError::NotFound(msg) => (msg, Vec::new()),
            AppError::DatabaseError(msg) => (format!("Database error: {msg}"), Vec::new()),
            AppError::Upstream { message, errors } => (message, errors),
        };
        let body = ErrorBody {
            status: status.as_u16(),
            message,
            errors,
        };
        (status, Json(body)).into_response()
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::JobMetricsDisabled | CaptureError::GpuUtilizationDisabled => {
                AppError::IntegrationDisabled(err.to_string())
            }
            CaptureError::DatabaseNotConfigured | CaptureError::PrometheusNotConfigured => {
                AppError::NotConfigured(err.to_string())
            }
            CaptureError::UtilizationUnavailable { errors } => AppError::Upstream {
                message: "Failed to query GPU utilization".to_string(),
                errors,
            },
        }
    }
}

impl From<LookupError> for AppError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::GpuUtilizationDisabled | LookupError::JobMetricsDisabled => {
                AppError::IntegrationDisabled(err.to_string())
            }
            LookupError::DatabaseNotConfigured => AppError::NotConfigured(err.to_string()),
            LookupError::Database(e) => e.into(),
        }
    }
}

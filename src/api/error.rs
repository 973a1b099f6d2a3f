use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;

/// Error body understood by the front-end: `{"detail": "..."}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ScrapeError::Validation(msg) => {
                tracing::warn!(message = %msg, "rejected scraping request");
                StatusCode::BAD_REQUEST
            }
            ScrapeError::JobNotFound(id) => {
                tracing::debug!(job_id = %id, "job not found");
                StatusCode::NOT_FOUND
            }
            ScrapeError::NotReady(status) => {
                tracing::debug!(%status, "download requested before completion");
                StatusCode::BAD_REQUEST
            }
            ScrapeError::TooManyJobs { limit } => {
                tracing::warn!(limit, "active job limit reached");
                StatusCode::TOO_MANY_REQUESTS
            }
            ScrapeError::Systemic(failure) => {
                tracing::error!(error = %failure, "results site unreachable");
                StatusCode::BAD_GATEWAY
            }
            ScrapeError::ArtifactUnavailable(e) => {
                tracing::error!(error = %e, "artifact missing for completed job");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ScrapeError::Report(e) => {
                tracing::error!(error = %e, "report error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

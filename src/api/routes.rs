//! API route definitions.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::error::ScrapeError;
use crate::jobs::{JobEntry, JobId, JobParams, JobStatus, JobSummary};

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/start-scraping", post(start_scraping))
        .route("/status/{job_id}", get(job_status))
        .route("/download/{job_id}", get(download_results))
        .route("/jobs", get(list_jobs))
        .route("/test-connection", get(test_connection))
}

/// Body of `POST /api/start-scraping`. Omitted fields take the defaults the
/// front-end form starts with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapeRequest {
    pub year: String,
    pub college_code: String,
    pub branch_code: String,
    pub start_pin: u32,
    pub end_pin: u32,
    #[serde(deserialize_with = "string_or_number")]
    pub semester: String,
}

impl Default for ScrapeRequest {
    fn default() -> Self {
        Self {
            year: "22".to_string(),
            college_code: "008".to_string(),
            branch_code: "CM".to_string(),
            start_pin: 1,
            end_pin: 67,
            semester: "5".to_string(),
        }
    }
}

impl From<ScrapeRequest> for JobParams {
    fn from(req: ScrapeRequest) -> Self {
        JobParams {
            year: req.year.trim().to_string(),
            college_code: req.college_code.trim().to_string(),
            branch_code: req.branch_code.trim().to_uppercase(),
            start_pin: req.start_pin,
            end_pin: req.end_pin,
            semester: req.semester.trim().to_string(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_percentage: f64,
    pub processed_count: u32,
    pub total_count: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub estimated_time_remaining: Option<u64>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusResponse {
    fn from_entry(entry: &JobEntry) -> Self {
        let state = entry.state();
        Self {
            job_id: entry.id,
            status: state.status,
            progress_percentage: state.progress_percentage(entry.total_count),
            processed_count: state.processed_count,
            total_count: entry.total_count,
            success_count: state.success_count,
            failed_count: state.failed_count,
            estimated_time_remaining: match state.status {
                JobStatus::InProgress => state.estimated_time_remaining,
                _ => None,
            },
            message: state.message,
            created_at: entry.created_at,
            updated_at: state.updated_at,
            completed_at: state.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub active_jobs: usize,
    pub jobs: Vec<JobSummary>,
}

/// Unknown and malformed ids are both "not found".
fn lookup(state: &AppState, raw_id: &str) -> Result<std::sync::Arc<JobEntry>, ScrapeError> {
    raw_id
        .parse::<JobId>()
        .ok()
        .and_then(|id| state.registry().entry(&id))
        .ok_or_else(|| ScrapeError::JobNotFound(raw_id.to_string()))
}

async fn start_scraping(
    State(state): State<AppState>,
    payload: Result<Json<ScrapeRequest>, JsonRejection>,
) -> Result<Json<JobCreated>, ScrapeError> {
    let Json(request) = payload.map_err(|e| ScrapeError::Validation(e.body_text()))?;
    let entry = state.runner.submit(request.into())?;
    Ok(Json(JobCreated {
        job_id: entry.id,
        status: JobStatus::Pending,
        message: "Scraping job started successfully".to_string(),
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ScrapeError> {
    let entry = lookup(&state, &job_id)?;
    Ok(Json(StatusResponse::from_entry(&entry)))
}

async fn download_results(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ScrapeError> {
    let entry = lookup(&state, &job_id)?;
    let job_state = entry.state();
    let path = match (job_state.status, job_state.artifact_path) {
        (JobStatus::Completed, Some(path)) => path,
        (status, _) => return Err(ScrapeError::NotReady(status)),
    };

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(ScrapeError::ArtifactUnavailable)?;
    let disposition = format!(
        "attachment; filename={}",
        entry.params.download_filename()
    );

    Ok((
        [
            (header::CONTENT_TYPE, XLSX_MIME.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Json<JobList> {
    let jobs = state.registry().list();
    Json(JobList {
        active_jobs: jobs.len(),
        jobs,
    })
}

async fn test_connection(State(state): State<AppState>) -> Json<Value> {
    match state.runner.source().probe().await {
        Ok(info) => Json(json!({
            "status": "success",
            "message": format!("Successfully connected to results site via {}", info.form_url),
            "form_url": info.form_url,
            "form_fields": info.form_fields,
        })),
        Err(failure) => {
            tracing::warn!(error = %failure, "connection test failed");
            Json(json!({
                "status": "error",
                "message": format!("Connection test failed: {failure}"),
                "suggestions": [
                    "Check if the results website is accessible from this host",
                    "Verify outbound HTTPS is allowed by the firewall",
                    "Try again later - the results server might be temporarily down",
                ],
            }))
        }
    }
}

use thiserror::Error;

use crate::fetch::FetchFailure;
use crate::jobs::JobStatus;
use crate::report::ReportError;

/// Errors surfaced to whoever submitted or is polling a job.
///
/// Per-PIN failures never appear here; they are recorded on the job.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("{0}")]
    Validation(String),

    #[error("Job not found")]
    JobNotFound(String),

    #[error("Job is not completed. Current status: {0}")]
    NotReady(JobStatus),

    #[error("Too many active jobs")]
    TooManyJobs { limit: usize },

    #[error("cannot reach results site: {0}")]
    Systemic(FetchFailure),

    #[error("Excel data not available")]
    ArtifactUnavailable(#[source] std::io::Error),

    #[error("report generation failed: {0}")]
    Report(#[from] ReportError),
}

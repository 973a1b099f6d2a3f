//! Scraping jobs -- data model, registry and runner.

pub mod registry;
pub mod runner;

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScrapeError;
use crate::fetch::FetchFailure;
use crate::parse::StudentResult;

pub use self::registry::{JobEntry, JobRegistry};
pub use self::runner::{JobRunner, Pacing, RunnerSettings};

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// Allowed moves: pending -> in_progress -> {completed, failed}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }

    /// Pending or in progress.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What to scrape. PINs cover the half-open range `[start_pin, end_pin)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub year: String,
    pub college_code: String,
    pub branch_code: String,
    pub start_pin: u32,
    pub end_pin: u32,
    pub semester: String,
}

impl JobParams {
    pub fn validate(&self, max_pins: u32) -> Result<(), ScrapeError> {
        for (field, value) in [
            ("year", &self.year),
            ("college_code", &self.college_code),
            ("branch_code", &self.branch_code),
            ("semester", &self.semester),
        ] {
            if value.trim().is_empty() {
                return Err(ScrapeError::Validation(format!("{field} must not be empty")));
            }
        }
        if self.start_pin >= self.end_pin {
            return Err(ScrapeError::Validation(
                "start_pin must be less than end_pin".to_string(),
            ));
        }
        if self.end_pin - self.start_pin > max_pins {
            return Err(ScrapeError::Validation(format!(
                "Maximum {max_pins} students per request"
            )));
        }
        Ok(())
    }

    pub fn total_count(&self) -> u32 {
        self.end_pin.saturating_sub(self.start_pin)
    }

    /// Full PIN strings, e.g. `22008-CM-001`.
    pub fn pins(&self) -> Vec<String> {
        (self.start_pin..self.end_pin)
            .map(|n| format!("{}{}-{}-{:03}", self.year, self.college_code, self.branch_code, n))
            .collect()
    }

    /// Filename offered to the browser for the spreadsheet.
    pub fn download_filename(&self) -> String {
        format!(
            "SBTET_Results_{}{}_{}_Sem{}.xlsx",
            self.year, self.college_code, self.branch_code, self.semester
        )
    }
}

/// Order PINs by their trailing number, so `22008-CM-999` comes before
/// `22008-CM-1000`.
pub fn compare_pins(a: &str, b: &str) -> Ordering {
    fn key(pin: &str) -> (&str, Option<u32>) {
        match pin.rsplit_once('-') {
            Some((prefix, number)) => (prefix, number.parse().ok()),
            None => (pin, None),
        }
    }
    key(a).cmp(&key(b)).then_with(|| a.cmp(b))
}

/// What happened to one PIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PinOutcome {
    Success { result: StudentResult },
    Failed { failure: FetchFailure },
}

/// One PIN's fetch + parse outcome. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub pin: String,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: PinOutcome,
}

impl ResultRecord {
    pub fn succeeded(pin: impl Into<String>, result: StudentResult, attempts: u32) -> Self {
        Self {
            pin: pin.into(),
            attempts,
            outcome: PinOutcome::Success { result },
        }
    }

    pub fn failed(pin: impl Into<String>, failure: FetchFailure, attempts: u32) -> Self {
        Self {
            pin: pin.into(),
            attempts,
            outcome: PinOutcome::Failed { failure },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PinOutcome::Success { .. })
    }
}

/// Mutable part of a job, always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobState {
    pub status: JobStatus,
    pub processed_count: u32,
    pub success_count: u32,
    pub failed_count: u32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present iff `status` is `Completed`.
    pub artifact_path: Option<PathBuf>,
    /// Seconds, only while in progress.
    pub estimated_time_remaining: Option<u64>,
}

impl JobState {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Pending,
            processed_count: 0,
            success_count: 0,
            failed_count: 0,
            message: "Job created, waiting to start...".to_string(),
            updated_at: now,
            completed_at: None,
            artifact_path: None,
            estimated_time_remaining: None,
        }
    }

    pub fn progress_percentage(&self, total_count: u32) -> f64 {
        if total_count == 0 {
            return 0.0;
        }
        f64::from(self.processed_count) / f64::from(total_count) * 100.0
    }
}

/// Point-in-time copy of a job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub params: JobParams,
    pub total_count: u32,
    pub created_at: DateTime<Utc>,
    pub state: JobState,
    pub results: Vec<ResultRecord>,
}

impl Job {
    pub fn progress_percentage(&self) -> f64 {
        self.state.progress_percentage(self.total_count)
    }
}

/// Row of the job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn params(start_pin: u32, end_pin: u32) -> JobParams {
        JobParams {
            year: "22".into(),
            college_code: "008".into(),
            branch_code: "CM".into(),
            start_pin,
            end_pin,
            semester: "5".into(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_pins_are_zero_padded_and_half_open() {
        let pins = params(1, 5).pins();
        assert_eq!(
            pins,
            vec!["22008-CM-001", "22008-CM-002", "22008-CM-003", "22008-CM-004"]
        );
        assert_eq!(params(1, 5).total_count(), 4);
    }

    #[test]
    fn test_validate_rejects_reversed_range() {
        let err = params(10, 5).validate(200).unwrap_err();
        assert!(matches!(err, ScrapeError::Validation(_)));
        assert!(params(5, 5).validate(200).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_range() {
        assert!(params(1, 251).validate(200).is_err());
        assert!(params(1, 201).validate(200).is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let mut p = params(1, 5);
        p.branch_code = "  ".into();
        assert!(p.validate(200).is_err());
    }

    #[test]
    fn test_pins_compare_numerically() {
        let mut pins = params(998, 1002).pins();
        pins.reverse();
        pins.sort_by(|a, b| compare_pins(a, b));
        assert_eq!(
            pins,
            vec!["22008-CM-998", "22008-CM-999", "22008-CM-1000", "22008-CM-1001"]
        );
        assert_eq!(compare_pins("22008-CM-007", "22008-CM-007"), Ordering::Equal);
    }

    #[test]
    fn test_download_filename() {
        assert_eq!(
            params(1, 5).download_filename(),
            "SBTET_Results_22008_CM_Sem5.xlsx"
        );
    }

    #[test]
    fn test_progress_percentage() {
        let mut state = JobState::new(Utc::now());
        assert_eq!(state.progress_percentage(4), 0.0);
        state.processed_count = 1;
        assert_eq!(state.progress_percentage(4), 25.0);
        assert_eq!(state.progress_percentage(0), 0.0);
    }

    #[test]
    fn test_result_record_serializes_outcome_tag() {
        let record = ResultRecord::failed("22008-CM-005", FetchFailure::NotFound, 1);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["pin"], "22008-CM-005");
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["failure"]["reason"], "not_found");
    }
}

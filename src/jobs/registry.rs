//! Process-wide job registry.
//!
//! Each job's mutable state lives in a `watch` channel: writers replace the
//! whole [`JobState`] in one step, so readers never see half-applied counters.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Job, JobId, JobParams, JobState, JobStatus, JobSummary, ResultRecord};
use crate::error::ScrapeError;

/// A registered job. Identity is fixed; state changes go through the
/// crate-internal mutators used by the runner.
pub struct JobEntry {
    pub id: JobId,
    pub params: JobParams,
    pub total_count: u32,
    pub created_at: DateTime<Utc>,
    state: watch::Sender<JobState>,
    results: Mutex<Vec<ResultRecord>>,
}

impl JobEntry {
    fn new(params: JobParams) -> Self {
        let now = Utc::now();
        let (state, _) = watch::channel(JobState::new(now));
        Self {
            id: Uuid::new_v4(),
            total_count: params.total_count(),
            params,
            created_at: now,
            state,
            results: Mutex::new(Vec::new()),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Receive every state replacement from now on.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Recorded outcomes in completion order.
    pub fn results(&self) -> Vec<ResultRecord> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Consistent copy of identity, state and results.
    pub fn snapshot(&self) -> Job {
        let results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        Job {
            id: self.id,
            params: self.params.clone(),
            total_count: self.total_count,
            created_at: self.created_at,
            state: self.state.borrow().clone(),
            results: results.clone(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        let state = self.state.borrow();
        JobSummary {
            job_id: self.id,
            status: state.status,
            progress_percentage: state.progress_percentage(self.total_count),
            created_at: self.created_at,
            message: state.message.clone(),
        }
    }

    /// Apply `update` as part of a move to `next`; refused moves leave the
    /// state untouched.
    fn transition(&self, next: JobStatus, update: impl FnOnce(&mut JobState)) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|state| {
            from = Some(state.status);
            if !state.status.can_transition_to(next) {
                return false;
            }
            state.status = next;
            state.updated_at = Utc::now();
            update(state);
            true
        });
        if !moved {
            warn!(job_id = %self.id, from = ?from, to = %next, "refused job status transition");
        }
        moved
    }

    pub(crate) fn begin(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.transition(JobStatus::InProgress, |state| state.message = message)
    }

    pub(crate) fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.state.send_modify(|state| {
            state.message = message;
            state.updated_at = Utc::now();
        });
    }

    /// Append one outcome and bump the counters in a single update.
    pub(crate) fn record(&self, record: ResultRecord, estimated_time_remaining: Option<u64>) {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let total = self.total_count;
        let applied = self.state.send_if_modified(|state| {
            if state.status != JobStatus::InProgress || state.processed_count >= total {
                return false;
            }
            state.processed_count += 1;
            if record.is_success() {
                state.success_count += 1;
            } else {
                state.failed_count += 1;
            }
            state.estimated_time_remaining = estimated_time_remaining;
            state.message = format!("Processed {}/{} students", state.processed_count, total);
            state.updated_at = Utc::now();
            true
        });
        if applied {
            debug!(job_id = %self.id, pin = %record.pin, success = record.is_success(), "result recorded");
            results.push(record);
        } else {
            warn!(job_id = %self.id, pin = %record.pin, "dropping result for job that is not accepting results");
        }
    }

    pub(crate) fn complete(&self, artifact_path: PathBuf, message: impl Into<String>) -> bool {
        let message = message.into();
        self.transition(JobStatus::Completed, |state| {
            state.message = message;
            state.completed_at = Some(state.updated_at);
            state.artifact_path = Some(artifact_path);
            state.estimated_time_remaining = None;
        })
    }

    pub(crate) fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.transition(JobStatus::Failed, |state| {
            state.message = message;
            state.completed_at = Some(state.updated_at);
            state.estimated_time_remaining = None;
        })
    }
}

/// Owns every job created since process start. Jobs are never evicted.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending job.
    pub fn create(&self, params: JobParams) -> Arc<JobEntry> {
        let entry = Arc::new(JobEntry::new(params));
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.id, Arc::clone(&entry));
        entry
    }

    /// Register a new pending job unless `max_active` jobs are already
    /// pending or running.
    pub fn try_create(&self, params: JobParams, max_active: usize) -> Result<Arc<JobEntry>, ScrapeError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let active = jobs
            .values()
            .filter(|job| job.state.borrow().status.is_active())
            .count();
        if active >= max_active {
            return Err(ScrapeError::TooManyJobs { limit: max_active });
        }
        let entry = Arc::new(JobEntry::new(params));
        jobs.insert(entry.id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn entry(&self, id: &JobId) -> Option<Arc<JobEntry>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.entry(id).map(|entry| entry.snapshot())
    }

    /// Summaries of every job, most recent first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.summary())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.job_id.cmp(&b.job_id)));
        summaries
    }
}

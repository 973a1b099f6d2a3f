//! Job runner -- drives one job from pending to a terminal state.
//!
//! PINs of a job are fetched with at most `max_concurrent_requests` requests
//! in flight. The cap is per job; the number of concurrently running jobs is
//! bounded separately by `max_active_jobs` at submission.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{JobEntry, JobParams, JobRegistry, ResultRecord};
use crate::error::ScrapeError;
use crate::fetch::{fetch_with_retry, FetchFailure, ResultSource, RetryPolicy};
use crate::parse::parse_result_page;
use crate::report::ReportBuilder;

/// Per-task latencies kept for the time-remaining estimate.
const LATENCY_WINDOW: usize = 10;

/// PINs are dispatched in batches with a pause in between, to go easy on
/// the results site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// 0 dispatches the whole range as one batch.
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Pacing {
    /// No pauses: the whole range is one batch.
    pub fn none() -> Self {
        Self {
            batch_size: 0,
            batch_delay: Duration::ZERO,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_concurrent_requests: usize,
    pub retry: RetryPolicy,
    pub pacing: Pacing,
    pub max_pins_per_job: u32,
    pub max_active_jobs: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 2,
            retry: RetryPolicy::default(),
            pacing: Pacing::default(),
            max_pins_per_job: 200,
            max_active_jobs: 3,
        }
    }
}

/// Moving average over the most recent task latencies.
struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    /// Seconds left for `remaining` tasks running `concurrency` at a time.
    fn estimate(&self, remaining: u32, concurrency: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let average = self.samples.iter().sum::<Duration>().as_secs_f64() / self.samples.len() as f64;
        let waves = f64::from(remaining) / concurrency.max(1) as f64;
        Some((average * waves).ceil() as u64)
    }
}

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    source: Arc<dyn ResultSource>,
    reports: ReportBuilder,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        source: Arc<dyn ResultSource>,
        reports: ReportBuilder,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            registry,
            source,
            reports,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn source(&self) -> &Arc<dyn ResultSource> {
        &self.source
    }

    /// Validate, register and start a job in the background.
    ///
    /// Invalid parameters never create a job.
    pub fn submit(self: &Arc<Self>, params: JobParams) -> Result<Arc<JobEntry>, ScrapeError> {
        params.validate(self.settings.max_pins_per_job)?;
        let entry = self
            .registry
            .try_create(params, self.settings.max_active_jobs)?;
        info!(job_id = %entry.id, total = entry.total_count, "job created");
        self.spawn(Arc::clone(&entry));
        Ok(entry)
    }

    /// Run `entry` on the runtime. The job record, not the handle, reports
    /// status.
    pub fn spawn(self: &Arc<Self>, entry: Arc<JobEntry>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run(entry).await })
    }

    pub async fn run(&self, entry: Arc<JobEntry>) {
        let job_id = entry.id;
        let started = Instant::now();

        if !entry.begin("Starting scraping process...") {
            return;
        }
        info!(%job_id, total = entry.total_count, "starting scraping job");

        if let Err(failure) = self.source.probe().await {
            let err = ScrapeError::Systemic(failure);
            error!(%job_id, error = %err, "job failed before scraping");
            entry.fail(format!("Scraping failed: {err}"));
            return;
        }

        let total = entry.total_count;
        entry.set_message(format!("Processing {total} students..."));

        let concurrency = self.settings.max_concurrent_requests.max(1);
        let limit = Arc::new(Semaphore::new(concurrency));
        let pins = entry.params.pins();
        let batch_size = match self.settings.pacing.batch_size {
            0 => pins.len().max(1),
            n => n,
        };
        let batches = pins.len().div_ceil(batch_size);

        let mut latencies = LatencyWindow::new(LATENCY_WINDOW);
        let mut done: u32 = 0;
        for (index, batch) in pins.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.pacing.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.pacing.batch_delay).await;
            }
            debug!(%job_id, batch = index + 1, batches, "dispatching batch");

            let mut tasks = JoinSet::new();
            let mut pending = BTreeSet::new();
            for pin in batch {
                pending.insert(pin.clone());
                let source = Arc::clone(&self.source);
                let limit = Arc::clone(&limit);
                let params = entry.params.clone();
                let retry = self.settings.retry;
                let pin = pin.clone();
                tasks.spawn(async move { scrape_pin(source, limit, pin, params, retry).await });
            }

            while let Some(joined) = tasks.join_next().await {
                let (record, latency) = match joined {
                    Ok(finished) => finished,
                    Err(e) => {
                        error!(%job_id, error = %e, "PIN task aborted");
                        continue;
                    }
                };
                pending.remove(&record.pin);
                latencies.push(latency);
                done += 1;

                if record.is_success() {
                    info!(%job_id, pin = %record.pin, attempts = record.attempts, "result retrieved");
                } else {
                    warn!(%job_id, pin = %record.pin, attempts = record.attempts, "result unavailable");
                }
                let eta = latencies.estimate(total.saturating_sub(done), concurrency);
                entry.record(record, eta);
            }

            // A task that died never reported; count its PIN as failed.
            for pin in pending {
                let failure = FetchFailure::ConnectionError("worker task aborted".to_string());
                entry.record(ResultRecord::failed(pin, failure, 0), None);
            }
        }

        let records = entry.results();
        let reports = self.reports.clone();
        let built = tokio::task::spawn_blocking(move || reports.build(job_id, &records)).await;

        let state = entry.state();
        match built {
            Ok(Ok(path)) => {
                let message = if state.success_count == 0 {
                    format!(
                        "Scraping completed: no results retrieved ({} of {} PINs failed)",
                        state.failed_count, total
                    )
                } else {
                    format!(
                        "Scraping completed successfully! {}/{} results retrieved",
                        state.success_count, total
                    )
                };
                info!(
                    %job_id,
                    success = state.success_count,
                    failed = state.failed_count,
                    elapsed_secs = started.elapsed().as_secs(),
                    artifact = %path.display(),
                    "job completed"
                );
                entry.complete(path, message);
            }
            Ok(Err(e)) => {
                let err = ScrapeError::Report(e);
                error!(%job_id, error = %err, "report generation failed");
                entry.fail(format!("Scraping failed: {err}"));
            }
            Err(e) => {
                error!(%job_id, error = %e, "report task aborted");
                entry.fail(format!("Scraping failed: report task aborted: {e}"));
            }
        }
    }
}

/// Fetch and parse one PIN. Latency covers the fetch only, not the wait for
/// a permit.
async fn scrape_pin(
    source: Arc<dyn ResultSource>,
    limit: Arc<Semaphore>,
    pin: String,
    params: JobParams,
    retry: RetryPolicy,
) -> (ResultRecord, Duration) {
    let (fetched, latency) = {
        let _permit = match limit.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let failure = FetchFailure::ConnectionError("worker pool closed".to_string());
                return (ResultRecord::failed(pin, failure, 0), Duration::ZERO);
            }
        };
        let started = Instant::now();
        let fetched = fetch_with_retry(source.as_ref(), &pin, &params, &retry).await;
        (fetched, started.elapsed())
    };

    let attempts = fetched.attempts;
    let record = match fetched.result {
        Ok(page) => match tokio::task::spawn_blocking(move || parse_result_page(&page)).await {
            Ok(Ok(result)) => ResultRecord::succeeded(pin, result, attempts),
            Ok(Err(failure)) => ResultRecord::failed(pin, failure.into(), attempts),
            Err(e) => ResultRecord::failed(
                pin,
                FetchFailure::ParseUnavailable(format!("parser task aborted: {e}")),
                attempts,
            ),
        },
        Err(failure) => ResultRecord::failed(pin, failure, attempts),
    };
    (record, latency)
}

//! Fetch client -- retrieves the raw result page for one PIN.
//!
//! A [`ResultSource`] performs single attempts and tags each one as a
//! success, a transient failure or a permanent failure. [`fetch_with_retry`]
//! drives the retry loop by matching on that tag.

pub mod http;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::jobs::JobParams;

pub use self::http::HttpResultSource;

/// Why a PIN could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FetchFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("no result found for this PIN")]
    NotFound,
    #[error("result page unavailable: {0}")]
    ParseUnavailable(String),
}

impl FetchFailure {
    /// Stable machine-readable code, used in reports and logs.
    pub fn code(&self) -> &'static str {
        match self {
            FetchFailure::Timeout => "timeout",
            FetchFailure::ConnectionError(_) => "connection_error",
            FetchFailure::NotFound => "not_found",
            FetchFailure::ParseUnavailable(_) => "parse_unavailable",
        }
    }
}

/// Body of a fetched result, as the site served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBody {
    Html(String),
    /// Marks memo published as a PDF document.
    Pdf(Vec<u8>),
}

/// Raw result content for one PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub pin: String,
    pub body: PageBody,
}

impl RawPage {
    pub fn html(pin: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            body: PageBody::Html(html.into()),
        }
    }

    pub fn pdf(pin: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            pin: pin.into(),
            body: PageBody::Pdf(bytes),
        }
    }
}

/// Outcome of a single network attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttempt {
    Success(RawPage),
    /// Worth retrying: timeouts, connection errors, overloaded server.
    Transient(FetchFailure),
    /// Retrying cannot help: unknown student, unsupported content.
    Permanent(FetchFailure),
}

/// What a reachability probe learned about the remote site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub form_url: String,
    pub form_fields: usize,
}

/// A source of result pages.
#[async_trait::async_trait]
pub trait ResultSource: Send + Sync {
    /// Check the remote site is reachable and usable.
    async fn probe(&self) -> Result<ConnectionInfo, FetchFailure>;

    /// Make exactly one attempt at fetching the page for `pin`.
    async fn fetch_once(&self, pin: &str, params: &JobParams) -> FetchAttempt;
}

/// Attempt count and linear backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Treated as at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` failures.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Final result of [`fetch_with_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub result: Result<RawPage, FetchFailure>,
    pub attempts: u32,
}

/// Fetch `pin`, retrying transient failures up to `policy.max_attempts`.
pub async fn fetch_with_retry(
    source: &dyn ResultSource,
    pin: &str,
    params: &JobParams,
    policy: &RetryPolicy,
) -> FetchOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match source.fetch_once(pin, params).await {
            FetchAttempt::Success(page) => {
                if attempt > 1 {
                    debug!(%pin, attempts = attempt, "fetch succeeded after retry");
                }
                return FetchOutcome {
                    result: Ok(page),
                    attempts: attempt,
                };
            }
            FetchAttempt::Transient(failure) if attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    %pin,
                    error = %failure,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            FetchAttempt::Transient(failure) | FetchAttempt::Permanent(failure) => {
                return FetchOutcome {
                    result: Err(failure),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted sources shared by the fetch, runner and API tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a per-PIN script of attempts; PINs without a script succeed
    /// with [`fixture_page`].
    #[derive(Default)]
    pub struct ScriptedSource {
        scripts: Mutex<HashMap<String, VecDeque<FetchAttempt>>>,
        pub calls: AtomicUsize,
        pub unreachable: bool,
        pub delay: Option<Duration>,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(self, pin: &str, attempts: Vec<FetchAttempt>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(pin.to_string(), attempts.into());
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn unreachable(mut self) -> Self {
            self.unreachable = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl ResultSource for ScriptedSource {
        async fn probe(&self) -> Result<ConnectionInfo, FetchFailure> {
            if self.unreachable {
                return Err(FetchFailure::ConnectionError("network unreachable".into()));
            }
            Ok(ConnectionInfo {
                form_url: "http://stub/results.do".into(),
                form_fields: 0,
            })
        }

        async fn fetch_once(&self, pin: &str, _params: &JobParams) -> FetchAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(pin)
                .and_then(|queue| queue.pop_front());

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            scripted.unwrap_or_else(|| FetchAttempt::Success(RawPage::html(pin, fixture_page(pin))))
        }
    }

    /// A result page in the remote site's table layout.
    pub fn fixture_page(pin: &str) -> String {
        format!(
            r#"<html><body>
<table>
  <tr><td>PIN : {pin}</td><td>Name : RAVI KUMAR</td></tr>
</table>
<table>
  <tr><th>Subject</th><th>External</th><th>Internal</th><th>Total</th><th>Result</th></tr>
  <tr><td>501</td><td>52</td><td>18</td><td>70</td><td>P</td></tr>
  <tr><td>502 Advanced Java</td><td>45</td><td>20</td><td>65</td><td>p</td></tr>
</table>
<p>Total : 135</p>
<p>Result : PASS</p>
</body></html>"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;
    use std::sync::atomic::Ordering;

    fn params() -> JobParams {
        JobParams {
            year: "22".into(),
            college_code: "008".into(),
            branch_code: "CM".into(),
            start_pin: 1,
            end_pin: 5,
            semester: "5".into(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_millis(500));
        assert_eq!(p.delay_after(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(FetchFailure::Timeout.code(), "timeout");
        assert_eq!(FetchFailure::NotFound.code(), "not_found");
        assert_eq!(
            FetchFailure::ParseUnavailable("pdf".into()).code(),
            "parse_unavailable"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_transient_failure_then_success() {
        let source = ScriptedSource::new()
            .script("22008-CM-001", vec![FetchAttempt::Transient(FetchFailure::Timeout)]);

        let started = tokio::time::Instant::now();
        let outcome = fetch_with_retry(&source, "22008-CM-001", &params(), &policy()).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_stops_at_max_attempts() {
        let failing = || FetchAttempt::Transient(FetchFailure::ConnectionError("reset".into()));
        let source = ScriptedSource::new().script(
            "22008-CM-002",
            vec![failing(), failing(), failing(), failing()],
        );

        let outcome = fetch_with_retry(&source, "22008-CM-002", &params(), &policy()).await;

        assert_eq!(
            outcome.result,
            Err(FetchFailure::ConnectionError("reset".into()))
        );
        assert_eq!(outcome.attempts, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let source = ScriptedSource::new()
            .script("22008-CM-005", vec![FetchAttempt::Permanent(FetchFailure::NotFound)]);

        let started = tokio::time::Instant::now();
        let outcome = fetch_with_retry(&source, "22008-CM-005", &params(), &policy()).await;

        assert_eq!(outcome.result, Err(FetchFailure::NotFound));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let source = ScriptedSource::new();
        let policy = RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::ZERO,
        };
        let outcome = fetch_with_retry(&source, "22008-CM-003", &params(), &policy).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 1);
    }
}

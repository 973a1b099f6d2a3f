use std::sync::{Arc, PoisonError, RwLock};

use super::{ConnectionInfo, FetchAttempt, FetchFailure, RawPage, ResultSource};
use crate::config::ScraperConfig;
use crate::jobs::JobParams;
use crate::parse;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use scraper::Html;
use tracing::{debug, info, warn};

/// Lookup form discovered on the results page.
#[derive(Debug, Clone)]
struct FormSpec {
    action: Url,
    hidden_fields: Vec<(String, String)>,
}

/// Result source backed by the live results site.
///
/// The lookup form is rediscovered on every probe, so each job starts with
/// fresh hidden fields; PIN requests reuse the last discovered form.
pub struct HttpResultSource {
    client: Client,
    base_url: Url,
    form: RwLock<Option<Arc<FormSpec>>>,
}

impl HttpResultSource {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid base URL: {}", config.base_url))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );

        let client = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            form: RwLock::new(None),
        })
    }

    fn cached_form(&self) -> Option<Arc<FormSpec>> {
        self.form
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_form(&self, form: Option<Arc<FormSpec>>) {
        *self.form.write().unwrap_or_else(PoisonError::into_inner) = form;
    }

    /// GET the results page and replace the cached form. A failed
    /// discovery clears the cache.
    async fn discover(&self) -> Result<Arc<FormSpec>, FetchFailure> {
        info!(url = %self.base_url, "analyzing form structure");
        let discovered = async {
            let response = self
                .client
                .get(self.base_url.clone())
                .send()
                .await
                .map_err(|e| request_failure(&e))?;
            if !response.status().is_success() {
                return Err(FetchFailure::ConnectionError(format!(
                    "HTTP {}",
                    response.status()
                )));
            }
            let html = response.text().await.map_err(|e| request_failure(&e))?;
            discover_form(&self.base_url, &html)
        }
        .await;

        match discovered {
            Ok(form) => {
                info!(action = %form.action, fields = form.hidden_fields.len(), "form analysis complete");
                let form = Arc::new(form);
                self.store_form(Some(Arc::clone(&form)));
                Ok(form)
            }
            Err(failure) => {
                self.store_form(None);
                Err(failure)
            }
        }
    }

    async fn form(&self) -> Result<Arc<FormSpec>, FetchFailure> {
        match self.cached_form() {
            Some(form) => Ok(form),
            None => self.discover().await,
        }
    }

    /// Follow a memo link from a result page. `None` when the link does not
    /// lead to a document, so the page itself is parsed instead.
    async fn follow_pdf_link(&self, pin: &str, page_url: &Url, href: &str) -> Option<FetchAttempt> {
        let url = match page_url.join(href) {
            Ok(url) => url,
            Err(e) => {
                warn!(%pin, %href, error = %e, "unusable PDF link");
                return None;
            }
        };
        debug!(%pin, %url, "following PDF link");

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return Some(tag(request_failure(&e))),
        };
        if !response.status().is_success() {
            warn!(%pin, %url, status = %response.status(), "PDF link did not resolve");
            return None;
        }
        match response.bytes().await {
            Ok(bytes) => Some(FetchAttempt::Success(RawPage::pdf(pin, bytes.to_vec()))),
            Err(e) => Some(tag(request_failure(&e))),
        }
    }
}

#[async_trait::async_trait]
impl ResultSource for HttpResultSource {
    async fn probe(&self) -> Result<ConnectionInfo, FetchFailure> {
        let form = self.discover().await?;
        Ok(ConnectionInfo {
            form_url: form.action.to_string(),
            form_fields: form.hidden_fields.len(),
        })
    }

    async fn fetch_once(&self, pin: &str, params: &JobParams) -> FetchAttempt {
        let form = match self.form().await {
            Ok(form) => form,
            Err(failure) => return tag(failure),
        };

        let mut fields = form.hidden_fields.clone();
        fields.push(("mode".to_string(), "getData".to_string()));
        fields.push(("aadhar1".to_string(), pin.to_string()));
        fields.push(("grade2".to_string(), params.semester.clone()));

        let response = match self
            .client
            .post(form.action.clone())
            .form(&fields)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return tag(request_failure(&e)),
        };

        if let Some(attempt) = classify_status(response.status()) {
            return attempt;
        }

        let content_type = content_type(&response);
        if content_type.contains("application/pdf") {
            return match response.bytes().await {
                Ok(bytes) => FetchAttempt::Success(RawPage::pdf(pin, bytes.to_vec())),
                Err(e) => tag(request_failure(&e)),
            };
        }
        if !content_type.contains("text/html") {
            return FetchAttempt::Permanent(FetchFailure::ParseUnavailable(format!(
                "unexpected content type: {content_type}"
            )));
        }

        let page_url = response.url().clone();
        let html = match response.text().await {
            Ok(html) => html,
            Err(e) => return tag(request_failure(&e)),
        };

        if parse::indicates_missing_student(&html) {
            debug!(%pin, "site reports no record");
            return FetchAttempt::Permanent(FetchFailure::NotFound);
        }

        if let Some(href) = parse::pdf_link(&html) {
            if let Some(attempt) = self.follow_pdf_link(pin, &page_url, &href).await {
                return attempt;
            }
        }

        FetchAttempt::Success(RawPage::html(pin, html))
    }
}

fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/html")
        .to_ascii_lowercase()
}

fn request_failure(e: &reqwest::Error) -> FetchFailure {
    if e.is_timeout() {
        FetchFailure::Timeout
    } else {
        FetchFailure::ConnectionError(e.to_string())
    }
}

/// Timeouts and connection errors are retried; everything else is final.
fn tag(failure: FetchFailure) -> FetchAttempt {
    match failure {
        FetchFailure::Timeout | FetchFailure::ConnectionError(_) => FetchAttempt::Transient(failure),
        other => FetchAttempt::Permanent(other),
    }
}

fn classify_status(status: StatusCode) -> Option<FetchAttempt> {
    if status.is_success() {
        return None;
    }
    let failure = FetchFailure::ConnectionError(format!("HTTP {status}"));
    Some(match status {
        StatusCode::NOT_FOUND => FetchAttempt::Permanent(FetchFailure::NotFound),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            FetchAttempt::Transient(failure)
        }
        s if s.is_server_error() => FetchAttempt::Transient(failure),
        _ => FetchAttempt::Permanent(failure),
    })
}

fn discover_form(base: &Url, html: &str) -> Result<FormSpec, FetchFailure> {
    let doc = Html::parse_document(html);
    let form_selector = parse::selector("form")?;
    let hidden_selector = parse::selector(r#"input[type="hidden"]"#)?;

    let form = doc
        .select(&form_selector)
        .next()
        .ok_or_else(|| FetchFailure::ParseUnavailable("no form found on results page".into()))?;

    let action = match form.value().attr("action").map(str::trim) {
        Some(action) if !action.is_empty() => base
            .join(action)
            .map_err(|e| FetchFailure::ParseUnavailable(format!("bad form action: {e}")))?,
        _ => base.clone(),
    };

    let hidden_fields = form
        .select(&hidden_selector)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect();

    Ok(FormSpec {
        action,
        hidden_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::fixture_page;
    use crate::fetch::PageBody;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FORM_PAGE: &str = r#"<html><body>
<form action="results.do" method="post">
  <input type="hidden" name="token" value="abc123">
  <input type="hidden" name="session" value="">
  <input type="text" name="aadhar1">
</form>
</body></html>"#;

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

    async fn server_with_form() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/APSBTET/results.do"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(FORM_PAGE, "text/html"))
            .mount(&server)
            .await;
        server
    }

    fn source_for(server: &MockServer, timeout_secs: u64) -> HttpResultSource {
        let config = ScraperConfig {
            base_url: format!("{}/APSBTET/results.do", server.uri()),
            request_timeout_secs: timeout_secs,
            ..ScraperConfig::default()
        };
        HttpResultSource::new(&config).unwrap()
    }

    #[test]
    fn test_discover_form_resolves_relative_action() {
        let base = Url::parse("https://example.org/APSBTET/index.do").unwrap();
        let form = discover_form(&base, FORM_PAGE).unwrap();
        assert_eq!(form.action.as_str(), "https://example.org/APSBTET/results.do");
        assert_eq!(form.hidden_fields.len(), 2);
        assert_eq!(form.hidden_fields[0], ("token".into(), "abc123".into()));
    }

    #[test]
    fn test_discover_form_without_form_fails() {
        let base = Url::parse("https://example.org/").unwrap();
        let err = discover_form(&base, "<html><body>maintenance</body></html>").unwrap_err();
        assert_eq!(err.code(), "parse_unavailable");
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            Some(FetchAttempt::Permanent(FetchFailure::NotFound))
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(FetchAttempt::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(FetchAttempt::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_reports_form() {
        let server = server_with_form().await;
        let source = source_for(&server, 5);

        let info = source.probe().await.unwrap();
        assert!(info.form_url.ends_with("/APSBTET/results.do"));
        assert_eq!(info.form_fields, 2);
    }

    #[tokio::test]
    async fn test_fetch_posts_pin_and_semester() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .and(path("/APSBTET/results.do"))
            .and(body_string_contains("aadhar1=22008-CM-001"))
            .and(body_string_contains("grade2=5"))
            .and(body_string_contains("token=abc123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(fixture_page("22008-CM-001"), "text/html; charset=utf-8"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;

        match attempt {
            FetchAttempt::Success(page) => {
                assert_eq!(page.pin, "22008-CM-001");
                assert!(matches!(page.body, PageBody::Html(ref html) if html.contains("RAVI KUMAR")));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert!(matches!(
            attempt,
            FetchAttempt::Transient(FetchFailure::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_student_is_permanent_not_found() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><body><p>Invalid PIN. Record not found.</p></body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-099", &params()).await;
        assert_eq!(attempt, FetchAttempt::Permanent(FetchFailure::NotFound));
    }

    #[tokio::test]
    async fn test_pdf_response_is_returned_as_document() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"%PDF-1.4 memo".to_vec(), "application/pdf"),
            )
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert_eq!(
            attempt,
            FetchAttempt::Success(RawPage::pdf("22008-CM-001", b"%PDF-1.4 memo".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_pdf_link_is_followed() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<html><body><a href="memos/22008-CM-001.PDF">Download memo</a></body></html>"#,
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/APSBTET/memos/22008-CM-001.PDF"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"%PDF-1.4 linked".to_vec(), "application/pdf"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert_eq!(
            attempt,
            FetchAttempt::Success(RawPage::pdf("22008-CM-001", b"%PDF-1.4 linked".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_broken_pdf_link_falls_back_to_page() {
        let server = server_with_form().await;
        let html = r#"<html><body><a href="/missing.pdf">memo</a></body></html>"#;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html"))
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert_eq!(attempt, FetchAttempt::Success(RawPage::html("22008-CM-001", html)));
    }

    #[tokio::test]
    async fn test_connection_check_rediscovers_form_each_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/APSBTET/results.do"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(FORM_PAGE, "text/html"))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        assert!(source.probe().await.is_ok());

        // The site stops serving the form; the cached copy must not hide that.
        let err = source.probe().await.unwrap_err();
        assert!(matches!(err, FetchFailure::ConnectionError(_)));
        assert!(source.cached_form().is_none());
    }

    #[tokio::test]
    async fn test_connection_check_refreshes_hidden_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/APSBTET/results.do"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(FORM_PAGE, "text/html"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/APSBTET/results.do"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(FORM_PAGE.replace("abc123", "fresh456"), "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("token=fresh456"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(fixture_page("22008-CM-001"), "text/html"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server, 5);
        source.probe().await.unwrap();
        source.probe().await.unwrap();

        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert!(matches!(attempt, FetchAttempt::Success(_)));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = server_with_form().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(fixture_page("22008-CM-001"), "text/html")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let source = source_for(&server, 1);
        let attempt = source.fetch_once("22008-CM-001", &params()).await;
        assert_eq!(attempt, FetchAttempt::Transient(FetchFailure::Timeout));
    }

    #[tokio::test]
    async fn test_unreachable_site_fails_probe() {
        let config = ScraperConfig {
            base_url: "http://127.0.0.1:9/APSBTET/results.do".to_string(),
            request_timeout_secs: 2,
            ..ScraperConfig::default()
        };
        let source = HttpResultSource::new(&config).unwrap();
        let err = source.probe().await.unwrap_err();
        assert!(matches!(
            err,
            FetchFailure::ConnectionError(_) | FetchFailure::Timeout
        ));
    }
}

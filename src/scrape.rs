use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identifier::{product_url, Identifier};

const V1_ENDPOINT: &str = "https://api.olostep.com/v1/scrapes";
const V2_ENDPOINT: &str = "https://api.olostep.com/v2/agent/web-agent";

/// Upper bound on the attempt budget.
pub const MAX_ATTEMPTS: u32 = 10;
const MAX_BACKOFF: Duration = Duration::from_secs(300);

// First non-empty string wins.
const CONTENT_POINTERS: &[&str] = &[
    "/result/markdown_content",
    "/markdown_content",
    "/content",
    "/result/html_content",
    "/html_content",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiVersion {
    V1,
    V2,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiVersion::V1 => f.write_str("v1"),
            ApiVersion::V2 => f.write_str("v2"),
        }
    }
}

impl FromStr for ApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(ApiVersion::V1),
            "v2" => Ok(ApiVersion::V2),
            other => Err(format!("unknown API version '{}'", other)),
        }
    }
}

/// Version → endpoint table.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub v1: String,
    pub v2: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            v1: V1_ENDPOINT.to_string(),
            v2: V2_ENDPOINT.to_string(),
        }
    }
}

impl Endpoints {
    pub fn for_version(&self, version: ApiVersion) -> &str {
        match version {
            ApiVersion::V1 => &self.v1,
            ApiVersion::V2 => &self.v2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub api_key: String,
    pub api_version: ApiVersion,
    /// When v2 exhausts its attempts, make one last request to v1.
    pub auto_fallback: bool,
    pub domain: String,
    pub timeout: Duration,
    pub attempts: u32,
    /// Delay after failed attempt `n` is `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// v2 only: seconds the agent waits for the page to settle.
    pub wait_time: u32,
    /// v2 only: number of review comments to pull.
    pub comments: u32,
    pub endpoints: Endpoints,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        ScrapeOptions {
            api_key: String::new(),
            api_version: ApiVersion::V1,
            auto_fallback: true,
            domain: "amazon.com".to_string(),
            timeout: Duration::from_secs(120),
            attempts: 3,
            backoff_base: Duration::from_secs(1),
            wait_time: 10,
            comments: 100,
            endpoints: Endpoints::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("scrape service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("response is missing content")]
    EmptyContent,
}

/// Outcome of one identifier's attempt series. Exactly one of `content` and
/// `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub identifier: Identifier,
    pub url: String,
    pub api_version: ApiVersion,
    pub attempts: u32,
    pub content: Option<String>,
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Never fails at the call boundary; failures are carried in the result.
    async fn scrape(&self, id: &Identifier) -> ScrapeResult;
}

/// Run `op` up to `attempts` times. After failed attempt `n` (1-based) with
/// attempts left, sleeps `base * 2^n`, capped at five minutes. Returns the
/// last outcome and the number of attempts made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    attempts: u32,
    base: Duration,
    label: &str,
    mut op: F,
) -> (Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if attempt >= attempts => {
                warn!("{} failed after {} attempts: {}", label, attempt, e);
                return (Err(e), attempt);
            }
            Err(e) => {
                let backoff = 2u32
                    .checked_pow(attempt)
                    .and_then(|factor| base.checked_mul(factor))
                    .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF));
                warn!(
                    "{} failed (attempt {}/{}): {}, backing off {:.1}s",
                    label,
                    attempt,
                    attempts,
                    e,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Olostep scrape client.
pub struct OlostepClient {
    http: reqwest::Client,
    opts: ScrapeOptions,
}

impl OlostepClient {
    pub fn new(opts: ScrapeOptions) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .build()
            .map_err(ScrapeError::Client)?;
        Ok(OlostepClient { http, opts })
    }

    fn request_body(&self, version: ApiVersion, url: &str) -> Value {
        match version {
            // v1 takes the bare url only.
            ApiVersion::V1 => json!({ "url": url }),
            ApiVersion::V2 => json!({
                "url": url,
                "wait_time": self.opts.wait_time,
                "screenshot": false,
                "extract_dynamic_content": true,
                "comments_number": self.opts.comments,
            }),
        }
    }

    async fn request_once(&self, version: ApiVersion, url: &str) -> Result<String, ScrapeError> {
        let response = self
            .http
            .post(self.opts.endpoints.for_version(version))
            .bearer_auth(&self.opts.api_key)
            .json(&self.request_body(version, url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                body: clip(&body, 300),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ScrapeError::Decode(e.to_string()))?;
        primary_content(&value)
            .map(str::to_string)
            .ok_or(ScrapeError::EmptyContent)
    }
}

#[async_trait]
impl Scraper for OlostepClient {
    async fn scrape(&self, id: &Identifier) -> ScrapeResult {
        let url = product_url(id, &self.opts.domain);
        let requested_at = Utc::now();
        let preferred = self.opts.api_version;
        let label = format!("scrape {} ({})", id, preferred);

        let target = url.as_str();
        let (outcome, mut attempts) =
            retry_with_backoff(self.opts.attempts, self.opts.backoff_base, &label, move |attempt| {
                debug!(identifier = %id, attempt, version = %preferred, "scrape attempt");
                self.request_once(preferred, target)
            })
            .await;

        let (outcome, api_version) = match outcome {
            Ok(content) => (Ok(content), preferred),
            Err(e) if preferred == ApiVersion::V2 && self.opts.auto_fallback => {
                let alt = ApiVersion::V1;
                warn!("{} failed on {}, falling back to {}", id, preferred, alt);
                attempts += 1;
                match self.request_once(alt, target).await {
                    Ok(content) => (Ok(content), alt),
                    Err(fe) => (
                        Err(format!("{}: {}; {} fallback: {}", preferred, e, alt, fe)),
                        alt,
                    ),
                }
            }
            Err(e) => (Err(e.to_string()), preferred),
        };

        match outcome {
            Ok(content) => {
                info!(
                    "Scraped {} via {} ({} chars, {} attempts)",
                    id,
                    api_version,
                    content.chars().count(),
                    attempts
                );
                ScrapeResult {
                    identifier: id.clone(),
                    url,
                    api_version,
                    attempts,
                    content: Some(content),
                    error: None,
                    requested_at,
                }
            }
            Err(error) => ScrapeResult {
                identifier: id.clone(),
                url,
                api_version,
                attempts,
                content: None,
                error: Some(error),
                requested_at,
            },
        }
    }
}

fn primary_content(body: &Value) -> Option<&str> {
    CONTENT_POINTERS
        .iter()
        .filter_map(|p| body.pointer(p))
        .filter_map(Value::as_str)
        .find(|s| !s.trim().is_empty())
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max).collect();
        format!("{}...", clipped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::identifier::normalize;

    fn opts_for(server: &MockServer) -> ScrapeOptions {
        ScrapeOptions {
            api_key: "test-key".into(),
            backoff_base: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            endpoints: Endpoints {
                v1: format!("{}/v1/scrapes", server.uri()),
                v2: format!("{}/v2/agent/web-agent", server.uri()),
            },
            ..ScrapeOptions::default()
        }
    }

    fn asin() -> Identifier {
        normalize("B08N5WRWNW").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let (out, attempts) = retry_with_backoff(3, Duration::from_secs(1), "test", |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(format!("boom {}", n))
                } else {
                    Ok(format!("content {}", n))
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), "content 3");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let (out, attempts) = retry_with_backoff(3, Duration::from_secs(1), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("down") }
        })
        .await;
        assert_eq!(out.unwrap_err(), "down");
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No sleep after the last attempt.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn large_budgets_do_not_overflow_the_backoff() {
        let start = tokio::time::Instant::now();
        let (out, attempts) =
            retry_with_backoff(40, Duration::from_nanos(1), "test", |_| async { Err::<(), _>("down") })
                .await;
        assert!(out.is_err());
        assert_eq!(attempts, 40);
        assert!(start.elapsed() <= MAX_BACKOFF * 39);
    }

    #[test]
    fn content_field_fallback_order() {
        let v = json!({ "result": { "markdown_content": "nested" }, "markdown_content": "top" });
        assert_eq!(primary_content(&v), Some("nested"));
        let v = json!({ "markdown_content": "", "content": "plain" });
        assert_eq!(primary_content(&v), Some("plain"));
        let v = json!({ "html_content": "<p>x</p>" });
        assert_eq!(primary_content(&v), Some("<p>x</p>"));
        let v = json!({ "markdown_content": "   " });
        assert_eq!(primary_content(&v), None);
    }

    #[test]
    fn version_parsing() {
        assert_eq!("V2".parse::<ApiVersion>().unwrap(), ApiVersion::V2);
        assert!("v3".parse::<ApiVersion>().is_err());
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrapes"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/scrapes"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(json!({ "url": "https://www.amazon.com/dp/B08N5WRWNW" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "result": { "markdown_content": "# Echo Dot" } })),
            )
            .mount(&server)
            .await;

        let client = OlostepClient::new(ScrapeOptions {
            auto_fallback: false,
            ..opts_for(&server)
        })
        .unwrap();
        let result = client.scrape(&asin()).await;

        assert!(result.content.is_some());
        assert_eq!(result.content.as_deref(), Some("# Echo Dot"));
        assert_eq!(result.attempts, 3);
        assert_eq!(result.api_version, ApiVersion::V1);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_content_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrapes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "markdown_content": "" })))
            .expect(3)
            .mount(&server)
            .await;

        let client = OlostepClient::new(ScrapeOptions {
            auto_fallback: false,
            ..opts_for(&server)
        })
        .unwrap();
        let result = client.scrape(&asin()).await;

        assert!(result.content.is_none());
        assert_eq!(result.attempts, 3);
        assert!(result.error.unwrap().contains("missing content"));
    }

    #[tokio::test]
    async fn v2_falls_back_to_v1_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/agent/web-agent"))
            .and(body_partial_json(json!({
                "wait_time": 10,
                "extract_dynamic_content": true,
                "comments_number": 100,
            })))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/scrapes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": "fallback page" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OlostepClient::new(ScrapeOptions {
            api_version: ApiVersion::V2,
            ..opts_for(&server)
        })
        .unwrap();
        let result = client.scrape(&asin()).await;

        assert_eq!(result.content.as_deref(), Some("fallback page"));
        assert_eq!(result.api_version, ApiVersion::V1);
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn v1_failures_stay_within_the_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        // Defaults: v1 preferred, auto-fallback on.
        let client = OlostepClient::new(opts_for(&server)).unwrap();
        let result = client.scrape(&asin()).await;

        assert!(result.content.is_none());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.api_version, ApiVersion::V1);
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.url.path() == "/v1/scrapes"));
    }

    #[tokio::test]
    async fn fallback_failure_reports_both_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = OlostepClient::new(ScrapeOptions {
            api_version: ApiVersion::V2,
            attempts: 2,
            ..opts_for(&server)
        })
        .unwrap();
        let result = client.scrape(&asin()).await;

        let err = result.error.unwrap();
        assert!(err.starts_with("v2: scrape service returned 502"));
        assert!(err.contains("v1 fallback"));
        assert_eq!(result.attempts, 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }
}

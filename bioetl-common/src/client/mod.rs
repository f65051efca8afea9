//! Resilient HTTP client: timeout tiers, bounded retries with exponential backoff, a per-host
//! circuit breaker and a per-host token bucket.
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RequestError;

pub mod breaker;
pub mod limiter;
pub mod profile;
pub mod retry;

use breaker::{Admission, CircuitBreaker, CircuitBreakers};
use limiter::{HostRateLimiter, Jitter, RateLimiters};
use profile::RequestProfile;
use retry::parse_retry_after_header;

const MAX_ERROR_BODY: usize = 512;

/// Breakers and limiters shared by every client that talks to the same hosts.
#[derive(Debug, Clone, Default)]
pub struct SharedHostState {
    pub breakers: Arc<CircuitBreakers>,
    pub limiters: Arc<RateLimiters>,
}

impl SharedHostState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value, RequestError> {
        serde_json::from_slice(&self.body).map_err(|source| RequestError::Decode {
            path: self.url.path().to_string(),
            source,
        })
    }
}

/// Result of a single attempt. Retry and breaker transitions are driven off this tag.
#[derive(Debug)]
enum AttemptOutcome {
    Success(HttpResponse),
    Retryable {
        status: Option<StatusCode>,
        retry_after: Option<Duration>,
        cause: String,
    },
    /// The host answered, or failed in a way we may not retry. `host_failure` says whether
    /// the breaker should count it.
    Fatal {
        error: RequestError,
        host_failure: bool,
    },
    /// The request never left the process.
    Rejected(RequestError),
}

pub struct RequestClient {
    base_url: Url,
    host: String,
    profile: RequestProfile,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<HostRateLimiter>,
    jitter: Jitter,
}

impl RequestClient {
    /// Build a client with its own breaker and limiter.
    pub fn new(base_url: &str, profile: RequestProfile) -> Result<Self, RequestError> {
        Self::with_shared_state(base_url, profile, &SharedHostState::new())
    }

    /// Build a client whose breaker and limiter are shared with every other client built
    /// from `shared` for the same host.
    pub fn with_shared_state(
        base_url: &str,
        profile: RequestProfile,
        shared: &SharedHostState,
    ) -> Result<Self, RequestError> {
        profile.check().map_err(RequestError::InvalidRequest)?;

        let base_url = Url::parse(base_url)
            .map_err(|e| RequestError::InvalidRequest(format!("bad base url {base_url}: {e}")))?;
        let host = host_key(&base_url)?;

        let http = build_http_client(&profile)?;
        let breaker = shared.breakers.for_host(&host, profile.breaker);
        let limiter = shared
            .limiters
            .for_host(&host, &profile.rate_limit)
            .map_err(RequestError::InvalidRequest)?;
        let jitter = Jitter::new(&profile.rate_limit);

        Ok(Self {
            base_url,
            host,
            profile,
            http,
            breaker,
            limiter,
            jitter,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn profile(&self) -> &RequestProfile {
        &self.profile
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Resolve a continuation link (`/root/relative?..` or absolute) against the base url.
    pub fn resolve_link(&self, link: &str) -> Result<Url, RequestError> {
        let url = self
            .base_url
            .join(link)
            .map_err(|e| RequestError::InvalidRequest(format!("bad link {link}: {e}")))?;
        if host_key(&url)? != self.host {
            return Err(RequestError::InvalidRequest(format!(
                "link {link} points away from {}",
                self.host
            )));
        }
        Ok(url)
    }

    fn url_for(&self, path: &str) -> Result<Url, RequestError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return self.resolve_link(path);
        }
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|e| RequestError::InvalidRequest(format!("bad path {path}: {e}")))
    }

    /// Issue a request, retrying transient failures according to the profile.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, RequestError> {
        let url = self.url_for(path)?;

        let admission = self
            .breaker
            .try_acquire()
            .map_err(|rejection| RequestError::CircuitOpen {
                host: self.host.clone(),
                remaining: rejection.remaining,
                last_error: rejection.last_error,
            })?;
        // A probe gets exactly one shot, its failure re-opens the breaker
        let max_attempts = match admission {
            Admission::Probe => 1,
            Admission::Allowed => self.profile.retry.max_attempts,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.attempt(&method, &url, params, body) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                self.breaker.release(admission);
                return Err(RequestError::Cancelled);
            };

            match outcome {
                AttemptOutcome::Success(response) => {
                    debug!(
                        method = %method,
                        path = url.path(),
                        status = response.status.as_u16(),
                        attempt,
                        "request succeeded"
                    );
                    counter!("bioetl_http_requests_total", "host" => self.host.clone(), "outcome" => "success")
                        .increment(1);
                    self.breaker.record_success(admission);
                    return Ok(response);
                }
                AttemptOutcome::Rejected(error) => {
                    self.breaker.release(admission);
                    return Err(error);
                }
                AttemptOutcome::Fatal {
                    error,
                    host_failure,
                } => {
                    warn!(
                        method = %method,
                        path = url.path(),
                        status = error.status(),
                        attempt,
                        "request failed and will not be retried: {}",
                        error
                    );
                    counter!("bioetl_http_requests_total", "host" => self.host.clone(), "outcome" => "fatal")
                        .increment(1);
                    if host_failure {
                        self.breaker.record_failure(admission, error.to_string());
                    } else {
                        self.breaker.record_success(admission);
                    }
                    return Err(error);
                }
                AttemptOutcome::Retryable {
                    status,
                    retry_after,
                    cause,
                } => {
                    if attempt >= max_attempts {
                        warn!(
                            method = %method,
                            path = url.path(),
                            status = status.map(|s| s.as_u16()),
                            attempt,
                            "giving up after {} attempts: {}",
                            attempt,
                            cause
                        );
                        counter!("bioetl_http_requests_total", "host" => self.host.clone(), "outcome" => "exhausted")
                            .increment(1);
                        self.breaker.record_failure(admission, cause.clone());
                        return Err(RequestError::TransientNetwork {
                            method: method.to_string(),
                            path: url.path().to_string(),
                            attempts: attempt,
                            status: status.map(|s| s.as_u16()),
                            cause,
                        });
                    }

                    let delay = self.profile.retry.retry_interval(attempt, retry_after);
                    warn!(
                        method = %method,
                        path = url.path(),
                        status = status.map(|s| s.as_u16()),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying request: {}",
                        cause
                    );
                    counter!("bioetl_http_retries_total", "host" => self.host.clone()).increment(1);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            self.breaker.release(admission);
                            return Err(RequestError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Issue a request and decode the body as JSON.
    pub async fn request_json(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RequestError> {
        self.request(method, path, params, body, cancel)
            .await?
            .json()
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> AttemptOutcome {
        self.limiter.acquire().await;
        let jitter = self.jitter.next_delay();
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }

        let retryable_method = self.profile.retry.is_retryable_method(method);
        let describe = |what: &str, e: &reqwest::Error| -> AttemptOutcome {
            let cause = format!("{what}: {}", describe_transport_error(e));
            if retryable_method {
                AttemptOutcome::Retryable {
                    status: None,
                    retry_after: None,
                    cause,
                }
            } else {
                AttemptOutcome::Fatal {
                    error: RequestError::NonRetryable {
                        method: method.to_string(),
                        path: url.path().to_string(),
                        cause,
                    },
                    host_failure: true,
                }
            }
        };

        let mut builder = self.http.request(method.clone(), url.clone());
        if !params.is_empty() {
            builder = builder.query(params);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return AttemptOutcome::Rejected(RequestError::InvalidRequest(e.to_string()))
            }
            Err(e) => return describe("send failed", &e),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();

        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => AttemptOutcome::Success(HttpResponse {
                    url: final_url,
                    status,
                    headers,
                    body: body.to_vec(),
                }),
                Err(e) => describe("reading body failed", &e),
            };
        }

        let retryable_status = self.profile.retry.is_retryable_status(status);
        if retryable_status && retryable_method {
            return AttemptOutcome::Retryable {
                status: Some(status),
                retry_after: parse_retry_after_header(&headers),
                cause: format!("server responded with {status}"),
            };
        }

        let body = response.text().await.ok().map(|mut text| {
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            text
        });
        AttemptOutcome::Fatal {
            error: RequestError::Status {
                method: method.to_string(),
                path: url.path().to_string(),
                status: status.as_u16(),
                body,
            },
            host_failure: retryable_status,
        }
    }
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out ({e})")
    } else if e.is_connect() {
        format!("connection failed ({e})")
    } else {
        e.to_string()
    }
}

fn host_key(url: &Url) -> Result<String, RequestError> {
    let host = url
        .host_str()
        .ok_or_else(|| RequestError::InvalidRequest(format!("{url} has no host")))?;
    Ok(match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn build_http_client(profile: &RequestProfile) -> Result<reqwest::Client, RequestError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &profile.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::InvalidRequest(format!("bad header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RequestError::InvalidRequest(format!("bad header value for {name}: {e}")))?;
        headers.insert(name, value);
    }

    reqwest::Client::builder()
        .connect_timeout(profile.timeouts.connect)
        .read_timeout(profile.timeouts.read_budget())
        .timeout(profile.timeouts.total)
        .pool_max_idle_per_host(profile.pool.max_idle_per_host)
        .pool_idle_timeout(profile.pool.idle_timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| RequestError::InvalidRequest(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::{Method::GET, Method::POST, MockServer};
    use serde_json::json;

    use super::breaker::CircuitBreakerState;
    use super::profile::ProfileOverrides;
    use super::*;

    fn fast_profile() -> RequestProfile {
        RequestProfile::default()
            .apply(&ProfileOverrides {
                max_attempts: Some(3),
                backoff_base_ms: Some(1),
                backoff_cap_ms: Some(5),
                rate_limit_calls: Some(1000),
                rate_limit_period_ms: Some(1000),
                jitter: Some(false),
                breaker_failure_threshold: Some(2),
                breaker_timeout_ms: Some(60_000),
                total_timeout_ms: Some(5_000),
                connect_timeout_ms: Some(1_000),
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_json_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/activity")
                .query_param("limit", "2")
                .header("accept", "application/json");
            then.status(200).json_body(json!({"activities": [1, 2]}));
        });

        let client = RequestClient::new(&server.url("/api"), fast_profile()).unwrap();
        let payload = client
            .request_json(
                Method::GET,
                "activity",
                &[("limit".to_string(), "2".to_string())],
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(payload, json!({"activities": [1, 2]}));
    }

    #[tokio::test]
    async fn test_retries_until_attempts_exhausted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        });

        let client = RequestClient::new(&server.base_url(), fast_profile()).unwrap();
        let err = client
            .request(Method::GET, "/flaky", &[], None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(mock.hits(), 3);
        match err {
            RequestError::TransientNetwork {
                attempts, status, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(503));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404).body("no such thing");
        });

        let client = RequestClient::new(&server.base_url(), fast_profile()).unwrap();
        let err = client
            .request(Method::GET, "/missing", &[], None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(mock.hits(), 1);
        match err {
            RequestError::Status { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body.as_deref(), Some("no such thing"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // the host answered, so nothing counts against it
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_post_is_not_retried_by_default() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/search");
            then.status(503);
        });

        let client = RequestClient::new(&server.base_url(), fast_profile()).unwrap();
        let err = client
            .request(
                Method::POST,
                "/search",
                &[],
                Some(&json!({"q": "aspirin"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(mock.hits(), 1);
        assert_eq!(err.status(), Some(503));
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/down");
            then.status(500);
        });

        let client = RequestClient::new(&server.base_url(), fast_profile()).unwrap();
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            drop(
                client
                    .request(Method::GET, "/down", &[], None, &cancel)
                    .await
                    .unwrap_err(),
            );
        }
        assert_eq!(client.breaker().state(), CircuitBreakerState::Open);
        let hits_before = mock.hits();

        let err = client
            .request(Method::GET, "/down", &[], None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::CircuitOpen { .. }));
        assert_eq!(mock.hits(), hits_before);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes_breaker() {
        let server = MockServer::start();
        let mut failing = server.mock(|when, then| {
            when.method(GET).path("/recovering");
            then.status(500);
        });

        let profile = fast_profile()
            .apply(&ProfileOverrides {
                breaker_timeout_ms: Some(50),
                ..Default::default()
            })
            .unwrap();
        let client = RequestClient::new(&server.base_url(), profile).unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            drop(
                client
                    .request(Method::GET, "/recovering", &[], None, &cancel)
                    .await,
            );
        }
        assert_eq!(client.breaker().state(), CircuitBreakerState::Open);

        failing.delete();
        let healthy = server.mock(|when, then| {
            when.method(GET).path("/recovering");
            then.status(200).json_body(json!({"ok": true}));
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        let payload = client
            .request_json(Method::GET, "/recovering", &[], None, &cancel)
            .await
            .unwrap();

        assert_eq!(payload, json!({"ok": true}));
        assert_eq!(healthy.hits(), 1);
        assert_eq!(client.breaker().state(), CircuitBreakerState::Closed);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_header_is_honoured() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/slow-down");
            then.status(429).header("Retry-After", "1");
        });

        let profile = fast_profile()
            .apply(&ProfileOverrides {
                max_attempts: Some(2),
                ..Default::default()
            })
            .unwrap();
        let client = RequestClient::new(&server.base_url(), profile).unwrap();
        let start = std::time::Instant::now();
        drop(
            client
                .request(Method::GET, "/slow-down", &[], None, &CancellationToken::new())
                .await
                .unwrap_err(),
        );

        assert_eq!(mock.hits(), 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/never");
            then.status(503);
        });

        let profile = fast_profile()
            .apply(&ProfileOverrides {
                max_attempts: Some(10),
                backoff_base_ms: Some(10_000),
                backoff_cap_ms: Some(10_000),
                ..Default::default()
            })
            .unwrap();
        let client = RequestClient::new(&server.base_url(), profile).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = client
            .request(Method::GET, "/never", &[], None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Cancelled));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_shared_state_shares_breaker_between_clients() {
        let server = MockServer::start();
        let shared = SharedHostState::new();
        let a = RequestClient::with_shared_state(&server.base_url(), fast_profile(), &shared)
            .unwrap();
        let b = RequestClient::with_shared_state(&server.url("/other"), fast_profile(), &shared)
            .unwrap();

        a.breaker().record_failure(Admission::Allowed, "boom");
        assert_eq!(b.breaker().failure_count(), 1);
    }

    #[test]
    fn test_links_resolve_against_host_root() {
        let client = RequestClient::new("https://www.ebi.ac.uk/chembl/api/data", fast_profile())
            .unwrap();
        let url = client
            .resolve_link("/chembl/api/data/activity.json?limit=20&offset=20")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.ebi.ac.uk/chembl/api/data/activity.json?limit=20&offset=20"
        );
        assert!(client.resolve_link("https://evil.example.com/x").is_err());

        let joined = client.url_for("activity.json").unwrap();
        assert_eq!(
            joined.as_str(),
            "https://www.ebi.ac.uk/chembl/api/data/activity.json"
        );
    }

    #[test]
    fn test_invalid_profile_is_rejected() {
        let mut profile = fast_profile();
        profile.retry.max_attempts = 0;
        assert!(matches!(
            RequestClient::new("https://example.org", profile),
            Err(RequestError::InvalidRequest(_))
        ));
    }
}

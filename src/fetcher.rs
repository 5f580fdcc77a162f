//! Rate-limited client for the aggregate-price API.
//!
//! Every outbound request goes through [`FetchClient::fetch`]: transient failures
//! (timeouts, connection errors, 5xx) are retried with capped exponential backoff and
//! ±30% jitter; 429 responses park every caller on the shared [`RateLimitGate`] and are
//! retried without consuming a retry slot.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::latency::LatencyStats;
use crate::config::{RetrySettings, RETRY_JITTER};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Body could not be decoded. Never retried.
    Parse,
    /// HTTP 429. Retried after `wait`, without limit.
    RateLimited { wait: Duration },
    /// HTTP 5xx.
    Server(u16),
    /// Request exceeded the per-request timeout.
    Timeout,
    /// Transport failure before a status line arrived.
    Connection,
    /// HTTP 4xx (other than 429) or an unexpected non-success status. Never retried.
    Client(u16),
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Parse => write!(f, "parse error"),
            FetchErrorKind::RateLimited { wait } => write!(f, "rate limited ({}ms)", wait.as_millis()),
            FetchErrorKind::Server(s) => write!(f, "server error {s}"),
            FetchErrorKind::Timeout => write!(f, "timeout"),
            FetchErrorKind::Connection => write!(f, "connection error"),
            FetchErrorKind::Client(s) => write!(f, "client error {s}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} for {url}: {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub detail: String,
}

impl FetchError {
    fn new(kind: FetchErrorKind, url: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::RateLimited { .. }
                | FetchErrorKind::Server(_)
                | FetchErrorKind::Timeout
                | FetchErrorKind::Connection
        )
    }
}

// ---------------------------------------------------------------------------
// Shared rate-limit marker
// ---------------------------------------------------------------------------

/// "Rate-limited until T", shared by every job that talks to the API.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push the marker to `now + wait`. Never moves it backwards.
    pub fn mark(&self, wait: Duration) {
        let candidate = Instant::now() + wait;
        if let Ok(mut until) = self.until.lock() {
            match *until {
                Some(existing) if existing >= candidate => {}
                _ => *until = Some(candidate),
            }
        }
    }

    /// Time left until the marker clears, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until.lock().ok().and_then(|u| *u)?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Sleep until the marker is clear. Re-checks after waking since another
    /// caller may have extended it meanwhile.
    pub async fn wait_clear(&self) {
        while let Some(left) = self.remaining() {
            debug!(wait_ms = left.as_millis() as u64, "[FETCH] waiting out shared rate limit");
            tokio::time::sleep(left).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Delay before retry number `attempt` (0-based): `initial * multiplier^attempt`,
/// capped at `max_delay`, then scaled by `1 + jitter` where `jitter` is in ±[`RETRY_JITTER`].
pub fn backoff_delay(policy: &RetrySettings, attempt: u32, jitter: f64) -> Duration {
    let base = policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt as i32);
    let capped = base.min(policy.max_delay.as_secs_f64());
    let jitter = jitter.clamp(-RETRY_JITTER, RETRY_JITTER);
    Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
}

/// Parse a Retry-After header: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct FetchClient {
    http: reqwest::Client,
    policy: RetrySettings,
    gate: Arc<RateLimitGate>,
    latency: Arc<LatencyStats>,
}

impl FetchClient {
    pub fn new(
        policy: RetrySettings,
        gate: Arc<RateLimitGate>,
        latency: Arc<LatencyStats>,
    ) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()?;
        Ok(Self {
            http,
            policy,
            gate,
            latency,
        })
    }

    /// Fetch and decode a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let body = self.fetch(url).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::new(FetchErrorKind::Parse, url, e.to_string()))
    }

    /// GET `url`, retrying per the policy. Returns the response body.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            self.gate.wait_clear().await;

            let err = match self.attempt_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            match err.kind {
                FetchErrorKind::RateLimited { wait } => {
                    warn!(
                        url = %url,
                        wait_ms = wait.as_millis() as u64,
                        "[FETCH] 429 received, all callers backing off"
                    );
                    self.gate.mark(wait);
                }
                _ if err.is_retryable() && attempt < self.policy.max_retries => {
                    let jitter = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
                    let delay = backoff_delay(&self.policy, attempt, jitter);
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        max = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "[FETCH] {}, retrying",
                        err.kind
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn attempt_once(&self, url: &str) -> Result<String, FetchError> {
        let started = std::time::Instant::now();
        let result = self.send(url).await;
        self.latency.record(started.elapsed());
        result
    }

    async fn send(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.http.get(url).send().await.map_err(|e| transport_error(url, e))?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()))
                .unwrap_or(self.policy.rate_limit_default);
            return Err(FetchError::new(FetchErrorKind::RateLimited { wait }, url, "429 Too Many Requests"));
        }
        if status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::new(FetchErrorKind::Server(status.as_u16()), url, truncate(&text)));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FetchError::new(FetchErrorKind::Client(status.as_u16()), url, truncate(&text)));
        }

        resp.text().await.map_err(|e| transport_error(url, e))
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> FetchError {
    let kind = if e.is_timeout() {
        FetchErrorKind::Timeout
    } else if e.is_decode() {
        FetchErrorKind::Parse
    } else {
        FetchErrorKind::Connection
    };
    FetchError::new(kind, url, e.to_string())
}

fn truncate(s: &str) -> String {
    s.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::http::{HeaderMap, HeaderValue, StatusCode as AxStatus};
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: u32) -> RetrySettings {
        RetrySettings {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_retries,
            rate_limit_default: Duration::from_millis(10),
            request_timeout: Duration::from_millis(300),
        }
    }

    fn client(max_retries: u32) -> FetchClient {
        FetchClient::new(policy(max_retries), RateLimitGate::new(), Arc::new(LatencyStats::new())).unwrap()
    }

    /// Responds with `fail` for the first `failures` calls, then 200 `{"ok":true}`.
    fn flaky(counter: Arc<AtomicUsize>, failures: usize, fail: AxStatus, retry_after: Option<&'static str>) -> Router {
        Router::new().route(
            "/",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let mut headers = HeaderMap::new();
                    if n < failures {
                        if let Some(v) = retry_after {
                            headers.insert("retry-after", HeaderValue::from_static(v));
                        }
                        (fail, headers, "nope".to_string())
                    } else {
                        (AxStatus::OK, headers, r#"{"ok":true}"#.to_string())
                    }
                }
            }),
        )
    }

    #[derive(Debug, serde::Deserialize)]
    struct Pong {
        ok: bool,
    }

    #[test]
    fn backoff_grows_caps_and_jitters() {
        let p = RetrySettings {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_retries: 5,
            rate_limit_default: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        };
        let secs = |attempt, jitter| backoff_delay(&p, attempt, jitter).as_secs_f64();
        assert!((secs(0, 0.0) - 1.0).abs() < 1e-6);
        assert!((secs(2, 0.0) - 4.0).abs() < 1e-6);
        assert!((secs(10, 0.0) - 10.0).abs() < 1e-6);
        // Jitter applies after the cap.
        assert!((secs(10, 0.3) - 13.0).abs() < 1e-6);
        assert!((secs(10, -0.3) - 7.0).abs() < 1e-6);
        // Out-of-range jitter is clamped to ±30%.
        assert!((secs(10, 5.0) - 13.0).abs() < 1e-6);
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_date() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn gate_only_moves_forward() {
        let gate = RateLimitGate::new();
        assert!(gate.remaining().is_none());
        gate.mark(Duration::from_secs(30));
        gate.mark(Duration::from_secs(1));
        assert!(gate.remaining().unwrap() > Duration::from_secs(20));
    }

    #[test]
    fn retryable_classification() {
        let e = |kind| FetchError::new(kind, "u", "");
        assert!(e(FetchErrorKind::Timeout).is_retryable());
        assert!(e(FetchErrorKind::Server(503)).is_retryable());
        assert!(e(FetchErrorKind::Connection).is_retryable());
        assert!(e(FetchErrorKind::RateLimited { wait: Duration::ZERO }).is_retryable());
        assert!(!e(FetchErrorKind::Parse).is_retryable());
        assert!(!e(FetchErrorKind::Client(404)).is_retryable());
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), 2, AxStatus::SERVICE_UNAVAILABLE, None)).await;
        let got: Pong = client(3).fetch_json(&format!("{base}/")).await.unwrap();
        assert!(got.ok);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_errors_exhaust_bounded_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), usize::MAX, AxStatus::INTERNAL_SERVER_ERROR, None)).await;
        let err = client(2).fetch(&format!("{base}/")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Server(500));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_retry_slots() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), 3, AxStatus::TOO_MANY_REQUESTS, Some("0"))).await;
        // Zero retries allowed, yet three 429s are waited out.
        let got: Pong = client(0).fetch_json(&format!("{base}/")).await.unwrap();
        assert!(got.ok);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rate_limit_without_header_uses_default_and_marks_gate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), 1, AxStatus::TOO_MANY_REQUESTS, None)).await;
        let c = client(0);
        let started = std::time::Instant::now();
        c.fetch(&format!("{base}/")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_rate_limit_marker() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), 1, AxStatus::TOO_MANY_REQUESTS, None)).await;
        let gate = RateLimitGate::new();
        let slow_default = RetrySettings {
            rate_limit_default: Duration::from_millis(300),
            ..policy(0)
        };
        let latency = Arc::new(LatencyStats::new());
        let first = FetchClient::new(slow_default.clone(), Arc::clone(&gate), Arc::clone(&latency)).unwrap();
        let second = FetchClient::new(slow_default, Arc::clone(&gate), latency).unwrap();

        let url = format!("{base}/");
        let first_task = tokio::spawn({
            let url = url.clone();
            async move { first.fetch(&url).await }
        });

        let left = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(left) = gate.remaining() {
                    return left;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The second caller never saw a 429 itself but still waits on the marker.
        let started = std::time::Instant::now();
        second.fetch(&url).await.unwrap();
        assert!(started.elapsed() + Duration::from_millis(5) >= left);

        first_task.await.unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_fast() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = serve(flaky(Arc::clone(&hits), usize::MAX, AxStatus::NOT_FOUND, None)).await;
        let err = client(5).fetch(&format!("{base}/")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Client(404));
        assert!(!err.is_retryable());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let app = Router::new().route("/", get(|| async { "definitely not json" }));
        let base = serve(app).await;
        let err = client(5).fetch_json::<Pong>(&format!("{base}/")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Parse);
    }

    #[tokio::test]
    async fn slow_responses_time_out_and_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    "late"
                }
            }),
        );
        let base = serve(app).await;
        let err = client(1).fetch(&format!("{base}/")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Timeout);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

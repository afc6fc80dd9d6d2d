use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

/// How a non-success response (or a transport error) should be handled upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Throttled,
    Transient,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ResponseDisposition::Throttled,
        StatusCode::REQUEST_TIMEOUT => ResponseDisposition::Transient,
        s if s.is_server_error() => ResponseDisposition::Transient,
        _ => ResponseDisposition::Fatal,
    }
}

/// Connection-level failures are worth another attempt; decode and builder errors are not.
pub fn classify_reqwest_error(err: &reqwest::Error) -> ResponseDisposition {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    if retryable {
        ResponseDisposition::Transient
    } else {
        ResponseDisposition::Fatal
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Doubling delay between transient retries, clamped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(multiplier).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub enum HttpAuth {
    Basic { username: String, token: String },
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    /// Sustained request rate allowed per source. `None` disables pacing.
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_source: 4,
            requests_per_minute: None,
        }
    }
}

/// Token bucket refilled continuously at `per_minute / 60` tokens a second.
///
/// The bucket starts full, so a cold source may burst up to `per_minute` requests.
#[derive(Debug)]
pub struct RequestPacer {
    burst: f64,
    per_second: f64,
    bucket: Mutex<(f64, Instant)>,
}

impl RequestPacer {
    pub fn per_minute(per_minute: u32) -> Self {
        let burst = f64::from(per_minute.max(1));
        Self {
            burst,
            per_second: burst / 60.0,
            bucket: Mutex::new((burst, Instant::now())),
        }
    }

    /// Wait until a token is available, then spend it.
    pub async fn acquire(&self) {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            let now = Instant::now();
            let (tokens, refilled_at) = *bucket;
            let available =
                (tokens + now.duration_since(refilled_at).as_secs_f64() * self.per_second).min(self.burst);
            // Spending into the negative reserves the next token for this caller.
            *bucket = (available - 1.0, now);
            if available >= 1.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64((1.0 - available) / self.per_second)
            }
        };
        if !wait.is_zero() {
            trace!(wait_ms = wait.as_millis() as u64, "pacing source request");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Concurrency slots and optional pacer owned by one source.
#[derive(Debug)]
struct SourceLane {
    slots: Semaphore,
    pacer: Option<RequestPacer>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// `None` for 2xx responses.
    pub fn disposition(&self) -> Option<ResponseDisposition> {
        (!self.status.is_success()).then(|| classify_status(self.status))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    pub fn body_snippet(&self) -> String {
        String::from_utf8_lossy(&self.body).chars().take(200).collect()
    }
}

/// Shared HTTP client for every source adapter.
///
/// One call is one attempt. The caller sees the raw status and headers and owns the retry
/// and throttle decisions.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    lane_config: (usize, Option<u32>),
    lanes: Mutex<HashMap<String, Arc<SourceLane>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match &config.user_agent {
            Some(agent) => builder.user_agent(agent.as_str()),
            None => builder,
        };

        Ok(Self {
            client: builder.build().context("building source http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            lane_config: (config.max_in_flight_per_source.max(1), config.requests_per_minute),
            lanes: Mutex::new(HashMap::new()),
        })
    }

    async fn lane(&self, source_id: &str) -> Arc<SourceLane> {
        let (slots, per_minute) = self.lane_config;
        self.lanes
            .lock()
            .await
            .entry(source_id.to_owned())
            .or_insert_with(|| {
                Arc::new(SourceLane {
                    slots: Semaphore::new(slots),
                    pacer: per_minute.map(RequestPacer::per_minute),
                })
            })
            .clone()
    }

    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        auth: Option<&HttpAuth>,
    ) -> Result<FetchedResponse, reqwest::Error> {
        let lane = self.lane(source_id).await;
        // Neither semaphore is ever closed.
        let _source_slot = lane.slots.acquire().await.ok();
        let _global_slot = self.in_flight.acquire().await.ok();
        if let Some(pacer) = &lane.pacer {
            pacer.acquire().await;
        }

        let request = match auth {
            Some(HttpAuth::Basic { username, token }) => {
                self.client.get(url).basic_auth(username, Some(token))
            }
            Some(HttpAuth::Bearer(token)) => self.client.get(url).bearer_auth(token),
            None => self.client.get(url),
        };

        let response = request.send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!(source_id, %status, bytes = body.len(), "source response");

        Ok(FetchedResponse {
            status,
            final_url,
            headers,
            body,
        })
    }
}

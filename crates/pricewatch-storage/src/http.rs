use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("fetch limiter closed")]
    LimiterClosed(#[from] AcquireError),
}

/// Transient-failure retries. 403 is final; 429 and 5xx are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Doubles per retry, capped at `max_delay`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn retries_status(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }

    pub fn retries_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }
}

/// Spaces request starts at least `spacing` apart across all callers.
#[derive(Debug)]
pub struct RequestPacer {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    /// Routes every request through this proxy when set.
    pub proxy_url: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_lane: usize,
    pub retry: RetryPolicy,
    pub min_request_spacing: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_language: None,
            proxy_url: None,
            max_in_flight: 16,
            max_in_flight_per_lane: 4,
            retry: RetryPolicy::default(),
            min_request_spacing: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client shared by the fetch tiers. Concurrency is bounded globally and
/// per lane (one lane per tier). Any final status, 403 and 503 included, comes
/// back as a response for the caller to judge.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    lane_limit: usize,
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(language) = &config.accept_language {
            headers.insert(
                ACCEPT_LANGUAGE,
                HeaderValue::from_str(language).context("invalid Accept-Language header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }
        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url).context("parsing proxy url")?);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            lane_limit: config.max_in_flight_per_lane.max(1),
            lanes: Mutex::new(HashMap::new()),
            pacer: config.min_request_spacing.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub async fn get(&self, lane: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(lane, || self.client.get(url))
            .instrument(info_span!("http_get", lane, url))
            .await
    }

    pub async fn post_json<B>(&self, lane: &str, url: &str, body: &B) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized,
    {
        self.execute(lane, || self.client.post(url).json(body))
            .instrument(info_span!("http_post", lane, url))
            .await
    }

    async fn lane(&self, lane: &str) -> Arc<Semaphore> {
        self.lanes
            .lock()
            .await
            .entry(lane.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.lane_limit)))
            .clone()
    }

    async fn execute<F>(&self, lane: &str, request: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _slot = self.in_flight.acquire().await?;
        let lane = self.lane(lane).await;
        let _lane_slot = lane.acquire().await?;

        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let can_retry = retry < self.retry.max_retries;

            let response = match request().send().await {
                Ok(response) => response,
                Err(err) if can_retry && RetryPolicy::retries_error(&err) => {
                    debug!(error = %err, retry, "transient request error");
                    tokio::time::sleep(self.retry.delay_before_retry(retry)).await;
                    retry += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let status = response.status();
            if can_retry && RetryPolicy::retries_status(status) {
                debug!(%status, retry, "transient status");
                tokio::time::sleep(self.retry.delay_before_retry(retry)).await;
                retry += 1;
                continue;
            }

            let final_url = response.url().to_string();
            let body = response.bytes().await?.to_vec();
            return Ok(FetchedResponse { status, final_url, body });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        let delays = (0..4).map(|r| policy.delay_before_retry(r)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [100, 200, 350, 350].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn block_statuses_are_final_but_overload_is_retried() {
        assert!(!RetryPolicy::retries_status(StatusCode::FORBIDDEN));
        assert!(!RetryPolicy::retries_status(StatusCode::NOT_FOUND));
        assert!(RetryPolicy::retries_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(RetryPolicy::retries_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_consecutive_turns() {
        let pacer = RequestPacer::new(Duration::from_millis(250));
        let start = Instant::now();

        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;

        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}

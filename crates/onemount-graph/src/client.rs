//! Microsoft Graph API client
//!
//! Wraps `reqwest::Client` with bearer authentication, base-URL construction,
//! per-request timeouts, proactive request pacing and automatic handling of
//! 429 throttling responses (Retry-After aware, exponential fallback).

use std::num::NonZeroU32;
use std::sync::RwLock;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::GraphError;

/// Base URL for Microsoft Graph API v1.0
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Per-request deadline (individual API calls).
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback wait when a 429 carries no Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Cap on automatic 429 retries per logical request.
const MAX_THROTTLE_RETRIES: u32 = 5;

/// Proactive pacing: requests per minute before we start queueing locally.
const REQUESTS_PER_MINUTE: u32 = 600;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Parses a Retry-After header value (integer seconds form).
pub(crate) fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// HTTP client for Microsoft Graph API calls.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<String>,
    limiter: DirectLimiter,
}

impl GraphClient {
    /// Creates a client against the production Graph endpoint.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_base_url(access_token, GRAPH_BASE_URL)
    }

    /// Creates a client against an arbitrary base URL (tests point this at a
    /// mock server).
    pub fn with_base_url(access_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .unwrap_or_default();
        let quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        Self {
            http,
            base_url: base_url.into(),
            token: RwLock::new(access_token.into()),
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Replaces the bearer token after a refresh.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap() = token.into();
    }

    /// The current bearer token (for absolute-URL requests such as upload
    /// sessions and delta pages).
    pub fn access_token(&self) -> String {
        self.token.read().unwrap().clone()
    }

    /// The raw HTTP client (shares the timeout configuration).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Builds an authenticated request for a path under the base URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .request(method, url)
            .bearer_auth(self.access_token())
    }

    /// Builds an authenticated request for an absolute URL (nextLink pages,
    /// upload session URLs).
    pub fn request_absolute(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(self.access_token())
    }

    /// Sends a request, classifying error statuses and absorbing throttling.
    ///
    /// 429 responses are retried up to [`MAX_THROTTLE_RETRIES`] times,
    /// honoring Retry-After when present; the final attempt surfaces
    /// [`GraphError::Throttled`] so callers can apply their own backoff.
    pub async fn send_checked(&self, request: RequestBuilder) -> Result<Response, GraphError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;

            let this_try = match request.try_clone() {
                Some(clone) => clone,
                // streaming bodies cannot be cloned; send the original once
                None => return self.classify(request.send().await?).await,
            };

            let response = this_try.send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return self.classify(response).await;
            }

            let wait = parse_retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
            attempt += 1;
            if attempt > MAX_THROTTLE_RETRIES {
                warn!(attempts = attempt, "Throttle retry budget exhausted");
                return Err(GraphError::Throttled {
                    retry_after_secs: wait.as_secs(),
                });
            }
            debug!(
                attempt,
                wait_secs = wait.as_secs(),
                "Throttled by server, backing off"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Maps non-success statuses onto typed errors.
    async fn classify(&self, response: Response) -> Result<Response, GraphError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::UNAUTHORIZED => Err(GraphError::Unauthorized),
            StatusCode::NOT_FOUND => Err(GraphError::NotFound),
            StatusCode::GONE => Err(GraphError::CursorExpired),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = parse_retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                Err(GraphError::Throttled {
                    retry_after_secs: wait.as_secs(),
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                if status == StatusCode::CONFLICT && body.contains("nameAlreadyExists") {
                    return Err(GraphError::NameAlreadyExists);
                }
                Err(GraphError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

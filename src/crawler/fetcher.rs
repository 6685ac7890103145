//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with proper user agent strings
//! - The `Transport` seam the workers fetch through
//! - Decoding response bodies into parseable documents
//! - Retry logic for transient failures
//! - Error classification

use super::frontier::FetchRequest;
use super::scheduler::HostLimiter;
use crate::config::{CrawlerConfig, UserAgentConfig};
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use reqwest::{header::CONTENT_TYPE, redirect::Policy, Client};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Raw response returned by a transport
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: Url,
    /// HTTP status code
    pub status_code: u16,
    /// Content-Type header value
    pub content_type: Option<String>,
    /// Response body
    pub body: Vec<u8>,
}

/// A successfully fetched and decoded HTML document
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Final URL after redirects; relative links resolve against it
    pub url: Url,
    pub status_code: u16,
    pub body: String,
}

/// Why a fetch attempt failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("unparseable document: {0}")]
    Parse(String),
}

/// Broad failure category, used for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Parse,
}

impl FetchError {
    /// Converts a reqwest error, separating timeouts and connection failures
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else if error.is_body() || error.is_decode() {
            Self::Body(error.to_string())
        } else {
            Self::Request(error.to_string())
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Parse(_) => FailureKind::Parse,
            _ => FailureKind::Network,
        }
    }

    /// Client errors other than 408 and 429 will not change on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status(code) => !(400..500).contains(code) || *code == 408 || *code == 429,
            _ => true,
        }
    }
}

/// Source of raw responses
///
/// The crawler only talks to the network through this trait, so tests (and
/// alternative clients) can stand in for reqwest.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches `url`, giving up after `timeout`
    ///
    /// Any HTTP response is returned as `Ok`, whatever its status.
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchedPage, FetchError>;
}

/// Transport backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a transport with the crawler's user agent
    pub fn from_config(config: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::new(build_http_client(config)?))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status_code = response.status().as_u16();
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(FetchError::from_reqwest)?
            .to_vec();

        Ok(FetchedPage {
            url: final_url,
            status_code,
            content_type,
            body,
        })
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use quarry::config::UserAgentConfig;
/// use quarry::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "Quarry".to_string(),
///     crawler_version: "0.1".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Turns a raw response into a document, or says why it cannot be one
///
/// Non-2xx statuses are failures. When the server declares a content type it
/// must be an HTML type. The body is decoded with the declared charset (a
/// byte order mark wins, UTF-8 is the default); undecodable bytes become
/// replacement characters rather than failing the page.
pub fn decode_page(page: FetchedPage) -> Result<FetchedDocument, FetchError> {
    if !(200..300).contains(&page.status_code) {
        return Err(FetchError::Status(page.status_code));
    }

    if let Some(content_type) = &page.content_type {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !mime.is_empty() && mime != "text/html" && mime != "application/xhtml+xml" {
            return Err(FetchError::Parse(format!(
                "content type {} is not HTML",
                mime
            )));
        }
    }

    let encoding = page
        .content_type
        .as_deref()
        .and_then(declared_charset)
        .unwrap_or(UTF_8);
    let (body, used, had_errors) = encoding.decode(&page.body);
    if had_errors {
        tracing::debug!("{} has bytes that are not valid {}", page.url, used.name());
    }

    Ok(FetchedDocument {
        url: page.url,
        status_code: page.status_code,
        body: body.into_owned(),
    })
}

/// Encoding named by the `charset` parameter of a content type, if known
fn declared_charset(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches('"').as_bytes())
    })
}

/// How failed fetches are retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retry_count: u32,
    /// Base backoff, doubled after every failed attempt
    pub backoff: Duration,
    /// Timeout of a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: Duration::from_millis(config.fetch_timeout_ms),
        }
    }

    /// Backoff before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Outcome of fetching one request
#[derive(Debug)]
pub enum FetchStatus {
    Success(FetchedDocument),
    Failure(FetchError),
}

/// A request together with the outcome of fetching it
#[derive(Debug)]
pub struct FetchResult {
    pub request: FetchRequest,
    pub status: FetchStatus,
    /// Attempts made, including the final one
    pub attempts: u32,
    /// Error of every failed attempt, in order
    pub errors: Vec<FetchError>,
}

/// Fetches a request with politeness and retry handling
///
/// # Retry Logic
///
/// | Condition | Action |
/// |-----------|--------|
/// | HTTP 2xx with an HTML body | Success |
/// | HTTP 4xx (except 408, 429) | Immediate failure |
/// | HTTP 5xx, 408, 429 | Retry with backoff |
/// | Timeout or connection error | Retry with backoff |
/// | Non-HTML content type | Retry with backoff |
///
/// Every attempt holds a host permit only while the request is on the wire;
/// backoff sleeps happen without one. An attempt that outlives the policy
/// timeout counts as a timeout, whatever the transport does with it.
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    limiter: &Arc<HostLimiter>,
    request: FetchRequest,
    policy: &RetryPolicy,
) -> FetchResult {
    let host = request.host();
    let mut errors = Vec::new();
    let mut attempt = 0;

    loop {
        let outcome = {
            let _permit = limiter.acquire(&host).await;
            tracing::debug!("Fetching {} (attempt {})", request.url, attempt + 1);
            tokio::time::timeout(policy.timeout, transport.fetch(&request.url, policy.timeout))
                .await
                .unwrap_or(Err(FetchError::Timeout))
        };

        let error = match outcome.and_then(decode_page) {
            Ok(document) => {
                return FetchResult {
                    request,
                    status: FetchStatus::Success(document),
                    attempts: attempt + 1,
                    errors,
                };
            }
            Err(error) => error,
        };

        tracing::debug!("Attempt {} for {} failed: {}", attempt + 1, request.url, error);
        let give_up = attempt >= policy.retry_count || !error.is_retryable();
        errors.push(error.clone());

        if give_up {
            return FetchResult {
                request,
                status: FetchStatus::Failure(error),
                attempts: attempt + 1,
                errors,
            };
        }

        tokio::time::sleep(policy.delay_for(attempt)).await;
        attempt += 1;
    }
}

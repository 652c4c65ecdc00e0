//! Network seam of the fetch client.
//!
//! The fetch layer only issues GETs and needs three things back: the status,
//! the body, and any `Retry-After` hint. Everything else about the exchange
//! stays inside the transport.

use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const USER_AGENT: &str = concat!("feedvault/", env!("CARGO_PKG_VERSION"));

/// GET request handed to an [`HttpClient`].
///
/// The URL may carry a token in its query string and header values may be
/// secrets, so `Debug` prints neither.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    /// Lower-cased header names with their values, one entry per name.
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout,
        }
    }

    /// Set a header, replacing any earlier value under the same name.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Debug for HttpRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = self
            .headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        f.debug_struct("HttpRequest")
            .field("url", &"<redacted>")
            .field("headers", &names)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Status, body and throttling hint of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// `Retry-After` in seconds, when the provider sent one.
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, 200..=299)
    }
}

/// Where an exchange broke down before a status line arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout,
    Connect,
    /// Headers arrived but the body could not be read.
    Body,
    /// The request could not be built; retrying cannot help.
    InvalidRequest,
    Other,
}

impl TransportFailure {
    pub const fn retryable(self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::Timeout => "request timed out",
            Self::Connect => "connection failed",
            Self::Body => "failed to read response body",
            Self::InvalidRequest => "invalid request",
            Self::Other => "request failed",
        }
    }
}

/// Transport-level failure: no HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: TransportFailure,
    detail: String,
}

impl HttpError {
    pub fn new(kind: TransportFailure, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(TransportFailure::Timeout, detail)
    }

    pub fn connect(detail: impl Into<String>) -> Self {
        Self::new(TransportFailure::Connect, detail)
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(TransportFailure::InvalidRequest, detail)
    }

    pub const fn kind(&self) -> TransportFailure {
        self.kind
    }

    pub const fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.kind.describe())
        } else {
            write!(f, "{}: {}", self.kind.describe(), self.detail)
        }
    }
}

impl std::error::Error for HttpError {}

impl From<reqwest::Error> for HttpError {
    fn from(error: reqwest::Error) -> Self {
        // The URL can carry an API token.
        let error = error.without_url();
        let kind = if error.is_builder() {
            TransportFailure::InvalidRequest
        } else if error.is_timeout() {
            TransportFailure::Timeout
        } else if error.is_connect() {
            TransportFailure::Connect
        } else if error.is_body() || error.is_decode() {
            TransportFailure::Body
        } else {
            TransportFailure::Other
        };
        Self::new(kind, error.to_string())
    }
}

/// Network transport used by the fetch client.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Production transport backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Client identifying itself as `feedvault/<version>`.
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap a preconfigured client, e.g. one with a proxy.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::from_client(reqwest::Client::new()))
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let mut call = self.client.get(&request.url).timeout(request.timeout);
            for (name, value) in &request.headers {
                call = call.header(name.as_str(), value.as_str());
            }

            let response = call.send().await?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.map_err(|error| {
                HttpError::new(TransportFailure::Body, error.without_url().to_string())
            })?;

            Ok(HttpResponse {
                status,
                body,
                retry_after,
            })
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

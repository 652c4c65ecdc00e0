//! Fetch results and classification of individual network attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::http_client::{HttpError, HttpResponse};
use crate::policy::SourcePolicy;
use crate::request::CacheKey;
use crate::{FetchError, SourceId};

const BODY_SNIPPET_CHARS: usize = 160;

/// Shape a successful body must have before it is cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Parseable, non-null JSON.
    #[default]
    Json,
    /// Any non-blank text, e.g. CSV.
    Text,
}

impl PayloadFormat {
    pub fn check(self, body: &str) -> Result<(), String> {
        match self {
            Self::Json => match serde_json::from_str::<serde_json::Value>(body) {
                Ok(serde_json::Value::Null) => Err(String::from("response body is JSON null")),
                Ok(_) => Ok(()),
                Err(error) => Err(format!("response body is not valid JSON: {error}")),
            },
            Self::Text => {
                if body.trim().is_empty() {
                    Err(String::from("response body is empty"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// A usable response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: CacheKey,
    pub body: String,
    pub fetched_at: OffsetDateTime,
    /// Network attempts made; zero for a cache hit.
    pub attempts: u32,
    /// Cache read or write failure encountered along the way. The payload is
    /// still valid; it just may not have been persisted.
    pub storage_error: Option<String>,
}

/// Why a fetch gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub source: SourceId,
    pub key: CacheKey,
    pub status: Option<u16>,
    pub message: String,
    pub attempts: u32,
}

/// Result of one `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    CacheHit(Payload),
    NetworkSuccess(Payload),
    RateLimited(FailureDetail),
    TransientError(FailureDetail),
    PermanentError(FailureDetail),
}

impl FetchOutcome {
    pub const fn payload(&self) -> Option<&Payload> {
        match self {
            Self::CacheHit(payload) | Self::NetworkSuccess(payload) => Some(payload),
            _ => None,
        }
    }

    pub const fn failure(&self) -> Option<&FailureDetail> {
        match self {
            Self::RateLimited(detail) | Self::TransientError(detail) | Self::PermanentError(detail) => {
                Some(detail)
            }
            _ => None,
        }
    }

    pub const fn is_success(&self) -> bool {
        self.payload().is_some()
    }

    pub const fn is_cache_hit(&self) -> bool {
        matches!(self, Self::CacheHit(_))
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::CacheHit(_) => "cache_hit",
            Self::NetworkSuccess(_) => "network_success",
            Self::RateLimited(_) => "rate_limited",
            Self::TransientError(_) => "transient_error",
            Self::PermanentError(_) => "permanent_error",
        }
    }

    /// Collapse into a `Result` for callers that only want the body.
    pub fn into_result(self) -> Result<Payload, FetchError> {
        match self {
            Self::CacheHit(payload) | Self::NetworkSuccess(payload) => Ok(payload),
            Self::RateLimited(detail) => Err(FetchError::RateLimited {
                provider: detail.source,
                attempts: detail.attempts,
                message: detail.message,
            }),
            Self::TransientError(detail) => Err(FetchError::Transient {
                provider: detail.source,
                attempts: detail.attempts,
                message: detail.message,
            }),
            Self::PermanentError(detail) => Err(FetchError::Permanent {
                provider: detail.source,
                status: detail.status,
                message: detail.message,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    RateLimited,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl AttemptFailure {
    pub fn retryable(&self) -> bool {
        self.kind != FailureKind::Permanent
    }

    pub fn into_outcome(self, source: SourceId, key: CacheKey, attempts: u32) -> FetchOutcome {
        let detail = FailureDetail {
            source,
            key,
            status: self.status,
            message: self.message,
            attempts,
        };
        match self.kind {
            FailureKind::RateLimited => FetchOutcome::RateLimited(detail),
            FailureKind::Transient => FetchOutcome::TransientError(detail),
            FailureKind::Permanent => FetchOutcome::PermanentError(detail),
        }
    }
}

/// Map one transport result onto success or a failure class.
pub(crate) fn classify_attempt(
    policy: &SourcePolicy,
    format: PayloadFormat,
    result: Result<HttpResponse, HttpError>,
) -> Result<String, AttemptFailure> {
    let response = match result {
        Ok(response) => response,
        Err(error) => {
            let kind = if error.retryable() {
                FailureKind::Transient
            } else {
                FailureKind::Permanent
            };
            return Err(AttemptFailure {
                kind,
                status: None,
                message: error.to_string(),
                retry_after: None,
            });
        }
    };

    let status = response.status;
    let retry_after = response.retry_after;
    let failure = |kind: FailureKind, message: String| AttemptFailure {
        kind,
        status: Some(status),
        message,
        retry_after,
    };

    if status == 429 || policy.is_throttled_body(&response.body) {
        return Err(failure(
            FailureKind::RateLimited,
            format!("HTTP {status}: {}", snippet(&response.body)),
        ));
    }

    if response.is_success() {
        return match format.check(&response.body) {
            Ok(()) => Ok(response.body),
            Err(reason) => Err(failure(FailureKind::Transient, format!("HTTP {status}: {reason}"))),
        };
    }

    let kind = if status == 408 || status >= 500 {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    };
    Err(failure(kind, format!("HTTP {status}: {}", snippet(&response.body))))
}

fn snippet(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > BODY_SNIPPET_CHARS {
        let mut cut = flat.chars().take(BODY_SNIPPET_CHARS).collect::<String>();
        cut.push('…');
        cut
    } else if flat.is_empty() {
        String::from("<empty body>")
    } else {
        flat
    }
}

use feedvault_store::StoreError;
use thiserror::Error;

use crate::SourceId;

/// Input validation errors for request descriptors and identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid source '{value}', expected one of finnhub, fred, cftc, yahoo, ecb, sec")]
    InvalidSource { value: String },

    #[error("endpoint cannot be empty")]
    EmptyEndpoint,
    #[error("endpoint '{value}' must not contain a query string or whitespace")]
    InvalidEndpoint { value: String },

    #[error("parameter name cannot be empty")]
    EmptyParamName,
    #[error("parameter '{value}' must be written as name=value")]
    MalformedParam { value: String },
}

/// Invalid rate-limit, retry or ttl settings. Fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{provider}: max_calls_per_minute must be positive, got {value}")]
    NonPositiveQuota { provider: SourceId, value: i64 },

    #[error("{provider}: {field} must not be negative, got {value}")]
    NegativeValue {
        provider: SourceId,
        field: &'static str,
        value: i64,
    },

    #[error("{provider}: {field} must be greater than zero")]
    ZeroValue {
        provider: SourceId,
        field: &'static str,
    },

    #[error("{provider}: {field} must be at most {max}, got {value}")]
    OutOfRange {
        provider: SourceId,
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{provider}: backoff cap {cap_ms}ms is below backoff base {base_ms}ms")]
    BackoffCapBelowBase {
        provider: SourceId,
        base_ms: u64,
        cap_ms: u64,
    },

    #[error("{provider}: base_url '{value}' must start with http:// or https://")]
    InvalidBaseUrl { provider: SourceId, value: String },

    #[error("no policy configured for source '{provider}'")]
    MissingPolicy { provider: SourceId },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Stable classification of [`FetchError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    Configuration,
    Storage,
    RateLimited,
    Transient,
    Permanent,
    Cancelled,
    Validation,
}

/// Errors surfaced by the fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("cache storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("{provider} kept rate limiting after {attempts} attempt(s): {message}")]
    RateLimited {
        provider: SourceId,
        attempts: u32,
        message: String,
    },

    #[error("{provider} failed transiently after {attempts} attempt(s): {message}")]
    Transient {
        provider: SourceId,
        attempts: u32,
        message: String,
    },

    #[error("{provider} rejected the request{}: {message}", status_suffix(.status))]
    Permanent {
        provider: SourceId,
        status: Option<u16>,
        message: String,
    },

    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|status| format!(" (HTTP {status})"))
        .unwrap_or_default()
}

impl FetchError {
    pub const fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Configuration(_) => FetchErrorKind::Configuration,
            Self::Storage(_) => FetchErrorKind::Storage,
            Self::RateLimited { .. } => FetchErrorKind::RateLimited,
            Self::Transient { .. } => FetchErrorKind::Transient,
            Self::Permanent { .. } => FetchErrorKind::Permanent,
            Self::Cancelled => FetchErrorKind::Cancelled,
            Self::Validation(_) => FetchErrorKind::Validation,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self.kind() {
            FetchErrorKind::Configuration => "fetch.configuration",
            FetchErrorKind::Storage => "fetch.storage",
            FetchErrorKind::RateLimited => "fetch.rate_limited",
            FetchErrorKind::Transient => "fetch.transient",
            FetchErrorKind::Permanent => "fetch.permanent",
            FetchErrorKind::Cancelled => "fetch.cancelled",
            FetchErrorKind::Validation => "fetch.validation",
        }
    }

    /// Whether a later run might succeed without operator action.
    pub const fn retryable(&self) -> bool {
        matches!(
            self.kind(),
            FetchErrorKind::RateLimited | FetchErrorKind::Transient | FetchErrorKind::Storage
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_error_message_includes_status() {
        let error = FetchError::Permanent {
            provider: SourceId::Finnhub,
            status: Some(403),
            message: String::from("invalid token"),
        };

        assert_eq!(
            error.to_string(),
            "finnhub rejected the request (HTTP 403): invalid token"
        );
        assert_eq!(error.code(), "fetch.permanent");
        assert!(!error.retryable());
    }

    #[test]
    fn exhausted_transient_errors_stay_retryable() {
        let error = FetchError::Transient {
            provider: SourceId::Fred,
            attempts: 4,
            message: String::from("HTTP 503"),
        };

        assert_eq!(error.kind(), FetchErrorKind::Transient);
        assert!(error.retryable());
    }
}

//! Raw, file/env-shaped configuration and its validation into
//! [`SourcePolicies`].
//!
//! Every field is optional in the file. Integers are read signed so that a
//! negative value is reported as a [`ConfigError`] rather than a parse
//! failure.
//!
//! ```toml
//! cache_path = "data/cache/cache.duckdb"
//! failure_threshold = 5
//!
//! [sources.finnhub]
//! max_calls_per_minute = 50
//! min_spacing_ms = 1300
//! endpoint_ttl_secs = { "calendar/earnings" = 604800 }
//!
//! [sources.fred]
//! max_calls_per_minute = 120
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{SourcePolicies, SourcePolicy};
use crate::rate_limit::{MAX_MIN_SPACING, MAX_WINDOW};
use crate::retry::Backoff;
use crate::{ConfigError, SourceId};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Per-source overrides on top of [`SourcePolicy::default_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOverrides {
    pub max_calls_per_minute: Option<i64>,
    pub window_secs: Option<i64>,
    pub min_spacing_ms: Option<i64>,
    pub default_ttl_secs: Option<i64>,
    pub endpoint_ttl_secs: BTreeMap<String, i64>,
    pub max_retries: Option<i64>,
    pub backoff_base_ms: Option<i64>,
    pub backoff_cap_ms: Option<i64>,
    pub base_url: Option<String>,
    pub throttle_markers: Option<Vec<String>>,
    pub request_timeout_ms: Option<i64>,
}

/// Top-level configuration as loaded from TOML and the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Cache file location. `None` uses the store's default path.
    pub cache_path: Option<PathBuf>,
    /// Unrecoverable failures per source that mark a run as failed.
    pub failure_threshold: u32,
    pub sources: BTreeMap<SourceId, SourceOverrides>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            sources: BTreeMap::new(),
        }
    }
}

impl FeedConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|error| ConfigError::Parse(error.to_string()))
    }

    /// Resolve every known source into a validated policy.
    pub fn policies(&self) -> Result<SourcePolicies, ConfigError> {
        let mut policies = SourcePolicies::empty();
        for source in SourceId::ALL {
            let overrides = self.sources.get(&source).cloned().unwrap_or_default();
            policies.insert(apply_overrides(SourcePolicy::default_for(source), &overrides)?);
        }
        Ok(policies)
    }
}

fn apply_overrides(
    mut policy: SourcePolicy,
    overrides: &SourceOverrides,
) -> Result<SourcePolicy, ConfigError> {
    let provider = policy.source;

    if let Some(value) = overrides.max_calls_per_minute {
        if value <= 0 {
            return Err(ConfigError::NonPositiveQuota { provider, value });
        }
        policy.rate_limit.max_calls = value;
    }
    if let Some(value) = overrides.window_secs {
        let secs = positive(provider, "window_secs", value)?;
        let secs = at_most(provider, "window_secs", secs, MAX_WINDOW.as_secs())?;
        policy.rate_limit.window = Duration::from_secs(secs);
    }
    if let Some(value) = overrides.min_spacing_ms {
        let ms = non_negative(provider, "min_spacing_ms", value)?;
        let ms = at_most(provider, "min_spacing_ms", ms, millis(MAX_MIN_SPACING))?;
        policy.rate_limit.min_spacing = Duration::from_millis(ms);
    }
    if let Some(value) = overrides.default_ttl_secs {
        policy.default_ttl = Duration::from_secs(non_negative(provider, "default_ttl_secs", value)?);
    }
    for (class, value) in &overrides.endpoint_ttl_secs {
        let ttl = non_negative(provider, "endpoint_ttl_secs", *value)?;
        policy.endpoint_ttls.insert(
            class.trim().trim_matches('/').to_owned(),
            Duration::from_secs(ttl),
        );
    }
    if let Some(value) = overrides.max_retries {
        let retries = non_negative(provider, "max_retries", value)?;
        policy.retry.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
    }
    if let Some(value) = overrides.request_timeout_ms {
        policy.request_timeout_ms = positive(provider, "request_timeout_ms", value)?;
    }

    let (mut base_ms, mut cap_ms) = match policy.retry.backoff {
        Backoff::Exponential { base, max, .. } => (millis(base), millis(max)),
        Backoff::Fixed { delay } => (millis(delay), millis(delay)),
    };
    if let Some(value) = overrides.backoff_base_ms {
        base_ms = positive(provider, "backoff_base_ms", value)?;
    }
    if let Some(value) = overrides.backoff_cap_ms {
        cap_ms = positive(provider, "backoff_cap_ms", value)?;
    }
    if cap_ms < base_ms {
        return Err(ConfigError::BackoffCapBelowBase {
            provider,
            base_ms,
            cap_ms,
        });
    }
    policy.retry.backoff =
        Backoff::exponential(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));

    if let Some(url) = &overrides.base_url {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl {
                provider,
                value: url.to_owned(),
            });
        }
        policy.base_url = url.trim_end_matches('/').to_owned();
    }
    if let Some(markers) = &overrides.throttle_markers {
        policy.throttle_markers = markers
            .iter()
            .map(|marker| marker.trim().to_owned())
            .filter(|marker| !marker.is_empty())
            .collect();
    }

    Ok(policy)
}

fn non_negative(provider: SourceId, field: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value).map_err(|_| ConfigError::NegativeValue {
        provider,
        field,
        value,
    })
}

fn positive(provider: SourceId, field: &'static str, value: i64) -> Result<u64, ConfigError> {
    match non_negative(provider, field, value)? {
        0 => Err(ConfigError::ZeroValue { provider, field }),
        value => Ok(value),
    }
}

fn at_most(provider: SourceId, field: &'static str, value: u64, max: u64) -> Result<u64, ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            provider,
            field,
            value,
            max,
        });
    }
    Ok(value)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

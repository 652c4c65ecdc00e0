use std::collections::BTreeMap;
use std::time::Duration;

use crate::rate_limit::RateLimit;
use crate::retry::RetryPolicy;
use crate::{ConfigError, SourceId};

const DAY: Duration = Duration::from_secs(86_400);

/// Validated limits and defaults for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    pub source: SourceId,
    pub base_url: String,
    pub rate_limit: RateLimit,
    pub retry: RetryPolicy,
    pub default_ttl: Duration,
    /// TTL per endpoint class, matched as a path prefix of the endpoint.
    pub endpoint_ttls: BTreeMap<String, Duration>,
    /// Body substrings that mean "throttled" even on a 2xx response.
    pub throttle_markers: Vec<String>,
    pub request_timeout_ms: u64,
}

impl SourcePolicy {
    fn base(source: SourceId, max_calls_per_minute: i64, min_spacing: Duration) -> Self {
        Self {
            source,
            base_url: source.default_base_url().to_owned(),
            rate_limit: RateLimit::per_minute(max_calls_per_minute, min_spacing),
            retry: RetryPolicy::default(),
            default_ttl: DAY,
            endpoint_ttls: BTreeMap::new(),
            throttle_markers: Vec::new(),
            request_timeout_ms: 20_000,
        }
    }

    /// Free tier: 60 calls/minute advertised, kept below it with a sleep floor.
    pub fn finnhub_default() -> Self {
        let mut policy = Self::base(SourceId::Finnhub, 50, Duration::from_millis(1_300));
        policy
            .endpoint_ttls
            .insert(String::from("calendar/earnings"), DAY * 7);
        policy.throttle_markers = vec![String::from("API limit reached")];
        policy
    }

    pub fn fred_default() -> Self {
        Self::base(SourceId::Fred, 120, Duration::ZERO)
    }

    pub fn cftc_default() -> Self {
        let mut policy = Self::base(SourceId::Cftc, 60, Duration::from_millis(250));
        policy.request_timeout_ms = 60_000;
        policy
    }

    pub fn yahoo_default() -> Self {
        let mut policy = Self::base(SourceId::Yahoo, 30, Duration::from_secs(1));
        policy.default_ttl = Duration::from_secs(6 * 3_600);
        policy.throttle_markers = vec![String::from("Too Many Requests")];
        policy
    }

    pub fn ecb_default() -> Self {
        Self::base(SourceId::Ecb, 60, Duration::ZERO)
    }

    /// SEC fair-access guidance: at most 10 requests per second.
    pub fn sec_default() -> Self {
        Self::base(SourceId::Sec, 600, Duration::from_millis(100))
    }

    pub fn default_for(source: SourceId) -> Self {
        match source {
            SourceId::Finnhub => Self::finnhub_default(),
            SourceId::Fred => Self::fred_default(),
            SourceId::Cftc => Self::cftc_default(),
            SourceId::Yahoo => Self::yahoo_default(),
            SourceId::Ecb => Self::ecb_default(),
            SourceId::Sec => Self::sec_default(),
        }
    }

    /// TTL for `endpoint`: the longest matching endpoint class, else the
    /// source default. A class matches whole path segments only.
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        self.endpoint_ttls
            .iter()
            .filter(|(class, _)| {
                endpoint == class.as_str()
                    || endpoint
                        .strip_prefix(class.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(class, _)| class.len())
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Whether a response body carries one of the throttle markers.
    pub fn is_throttled_body(&self, body: &str) -> bool {
        self.throttle_markers
            .iter()
            .any(|marker| !marker.is_empty() && body.contains(marker.as_str()))
    }
}

/// Policy table keyed by source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicies {
    policies: BTreeMap<SourceId, SourcePolicy>,
}

impl Default for SourcePolicies {
    fn default() -> Self {
        Self {
            policies: SourceId::ALL
                .into_iter()
                .map(|source| (source, SourcePolicy::default_for(source)))
                .collect(),
        }
    }
}

impl SourcePolicies {
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: SourcePolicy) -> Self {
        self.insert(policy);
        self
    }

    pub fn insert(&mut self, policy: SourcePolicy) {
        self.policies.insert(policy.source, policy);
    }

    pub fn get(&self, source: SourceId) -> Result<&SourcePolicy, ConfigError> {
        self.policies
            .get(&source)
            .ok_or(ConfigError::MissingPolicy { provider: source })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourcePolicy> {
        self.policies.values()
    }
}

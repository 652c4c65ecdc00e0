//! Request descriptors and their canonical cache fingerprints.
//!
//! A [`RequestDescriptor`] names one logical provider call: the source, the
//! endpoint path below the source's base URL, and the query parameters.
//! Credentials ride along with the descriptor so the transport can attach
//! them, but they never take part in the [`CacheKey`], in `Debug` output, or
//! in log lines.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http_client::HttpRequest;
use crate::{SourceId, ValidationError};

/// Auth material attached to the outgoing request only.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Token passed as a query parameter, e.g. `token=` or `api_key=`.
    QueryParam { name: String, value: String },
    /// Token passed in a named header, e.g. `X-Finnhub-Token`.
    Header { name: String, value: String },
    /// `Authorization: Bearer <token>`.
    Bearer(String),
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryParam { name, .. } => write!(f, "QueryParam({name}=<redacted>)"),
            Self::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Deterministic fingerprint of a request: `source|endpoint|k=v&k=v`.
///
/// Parameters appear in sorted order and every component is percent-encoded,
/// so separators inside names or values cannot make two descriptors collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a key string read back from storage or typed by an operator.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One logical external call.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    source: SourceId,
    endpoint: String,
    params: BTreeMap<String, String>,
    credential: Option<Credential>,
}

impl RequestDescriptor {
    /// Build a descriptor. Leading and trailing slashes on `endpoint` are
    /// dropped so `series` and `/series/` name the same call.
    pub fn new(source: SourceId, endpoint: impl AsRef<str>) -> Result<Self, ValidationError> {
        let trimmed = endpoint.as_ref().trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyEndpoint);
        }
        if trimmed.contains(['?', '#']) || trimmed.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidEndpoint {
                value: trimmed.to_owned(),
            });
        }

        Ok(Self {
            source,
            endpoint: trimmed.to_owned(),
            params: BTreeMap::new(),
            credential: None,
        })
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in params {
            self.params.insert(name.into(), value.into());
        }
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub const fn source(&self) -> SourceId {
        self.source
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn cache_key(&self) -> CacheKey {
        let params = self
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", urlencoding::encode(name), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        CacheKey(format!(
            "{}|{}|{}",
            self.source.as_str(),
            urlencoding::encode(&self.endpoint),
            params
        ))
    }

    /// Full URL below `base_url`, including a query-parameter credential.
    pub fn url(&self, base_url: &str) -> String {
        let mut url = format!("{}/{}", base_url.trim_end_matches('/'), self.endpoint);

        let mut query = self
            .params
            .iter()
            .map(|(name, value)| format!("{}={}", urlencoding::encode(name), urlencoding::encode(value)))
            .collect::<Vec<_>>();
        if let Some(Credential::QueryParam { name, value }) = &self.credential {
            query.push(format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            ));
        }

        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Transport request for this descriptor with auth applied.
    pub fn http_request(&self, base_url: &str, timeout: Duration) -> HttpRequest {
        let request = HttpRequest::get(self.url(base_url), timeout)
            .header("accept", "application/json, text/csv;q=0.9, */*;q=0.5");

        match &self.credential {
            Some(Credential::Header { name, value }) => request.header(name, value.clone()),
            Some(Credential::Bearer(token)) => {
                request.header("authorization", format!("Bearer {token}"))
            }
            Some(Credential::QueryParam { .. }) | None => request,
        }
    }
}

impl Debug for RequestDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("source", &self.source)
            .field("endpoint", &self.endpoint)
            .field("params", &self.params)
            .field("credential", &self.credential)
            .finish()
    }
}

/// Parse a `name=value` pair as typed on the command line.
pub fn parse_param(input: &str) -> Result<(String, String), ValidationError> {
    let Some((name, value)) = input.split_once('=') else {
        return Err(ValidationError::MalformedParam {
            value: input.to_owned(),
        });
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyParamName);
    }
    Ok((name.to_owned(), value.to_owned()))
}

//! Batch runs: one sequential fetch loop per source, sources in parallel.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fetch::{FetchClient, FetchOptions};
use crate::outcome::{FetchOutcome, PayloadFormat};
use crate::request::{Credential, RequestDescriptor};
use crate::{ConfigError, FetchError, SourceId, ValidationError};

/// One request plus the options to fetch it with.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub request: RequestDescriptor,
    pub options: FetchOptions,
}

impl FetchJob {
    pub fn new(request: RequestDescriptor) -> Self {
        Self {
            request,
            options: FetchOptions::default(),
        }
    }
}

/// An unrecoverable failure recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub key: String,
    pub outcome: &'static str,
    pub status: Option<u16>,
    pub message: String,
}

/// Per-source tallies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub requested: usize,
    pub network: usize,
    pub cache_hits: usize,
    /// Successful fetches whose cache read or write failed.
    pub storage_errors: usize,
    /// Jobs never attempted because the run was cancelled or the source is
    /// misconfigured.
    pub skipped: usize,
    pub failures: Vec<FailureRecord>,
}

impl SourceReport {
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Summary of a [`run_sources`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    #[serde(serialize_with = "rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(serialize_with = "rfc3339")]
    pub finished_at: OffsetDateTime,
    pub failure_threshold: u32,
    pub cancelled: bool,
    pub sources: BTreeMap<SourceId, SourceReport>,
}

fn rfc3339<S: serde::Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    let text = value.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&text)
}

impl RunReport {
    /// Sources whose unrecoverable failures exceed the threshold.
    pub fn sources_over_threshold(&self) -> Vec<SourceId> {
        let threshold = usize::try_from(self.failure_threshold).unwrap_or(usize::MAX);
        self.sources
            .iter()
            .filter(|(_, report)| report.failure_count() > threshold)
            .map(|(source, _)| *source)
            .collect()
    }

    pub fn threshold_exceeded(&self) -> bool {
        !self.sources_over_threshold().is_empty()
    }

    pub fn total_failures(&self) -> usize {
        self.sources.values().map(SourceReport::failure_count).sum()
    }

    pub fn total_cache_hits(&self) -> usize {
        self.sources.values().map(|report| report.cache_hits).sum()
    }

    pub fn total_network(&self) -> usize {
        self.sources.values().map(|report| report.network).sum()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::try_from(self.finished_at - self.started_at).unwrap_or(Duration::ZERO)
    }
}

/// Fetch every job, one task per source, and tally the results.
///
/// Jobs for the same source run in the order given. Successful payloads are
/// already persisted by the client, so a cancelled or failing run keeps
/// whatever it fetched before stopping.
pub async fn run_sources(client: &FetchClient, jobs: Vec<FetchJob>, failure_threshold: u32) -> RunReport {
    let run_id = Uuid::new_v4();
    let started_at = OffsetDateTime::now_utc();

    let mut batches: BTreeMap<SourceId, Vec<FetchJob>> = BTreeMap::new();
    for job in jobs {
        batches.entry(job.request.source()).or_default().push(job);
    }

    info!(%run_id, sources = batches.len(), "starting fetch run");

    let mut tasks = JoinSet::new();
    for (source, batch) in batches {
        let client = client.clone();
        tasks.spawn(async move { (source, run_batch(&client, batch).await) });
    }

    let mut sources = BTreeMap::new();
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((source, (report, was_cancelled))) => {
                cancelled |= was_cancelled;
                sources.insert(source, report);
            }
            Err(join_error) => {
                error!(%run_id, error = %join_error, "source task did not complete");
            }
        }
    }

    let report = RunReport {
        run_id,
        started_at,
        finished_at: OffsetDateTime::now_utc(),
        failure_threshold,
        cancelled,
        sources,
    };

    for source in report.sources_over_threshold() {
        warn!(
            %run_id,
            source = %source,
            threshold = failure_threshold,
            "source exceeded failure threshold"
        );
    }
    info!(
        %run_id,
        network = report.total_network(),
        cache_hits = report.total_cache_hits(),
        failures = report.total_failures(),
        cancelled,
        "fetch run finished"
    );
    report
}

async fn run_batch(client: &FetchClient, batch: Vec<FetchJob>) -> (SourceReport, bool) {
    let mut report = SourceReport {
        requested: batch.len(),
        ..SourceReport::default()
    };

    let total = batch.len();
    for (index, job) in batch.iter().enumerate() {
        let remaining = total - index - 1;
        match client.fetch(&job.request, &job.options).await {
            Ok(outcome) => record_outcome(&mut report, outcome),
            Err(FetchError::Cancelled) => {
                report.skipped += 1 + remaining;
                return (report, true);
            }
            Err(error) => {
                // Configuration errors repeat for every job of the source.
                report.failures.push(FailureRecord {
                    key: job.request.cache_key().into_inner(),
                    outcome: error.code(),
                    status: None,
                    message: error.to_string(),
                });
                report.skipped += remaining;
                return (report, false);
            }
        }
    }
    (report, false)
}

fn record_outcome(report: &mut SourceReport, outcome: FetchOutcome) {
    if let Some(payload) = outcome.payload() {
        if outcome.is_cache_hit() {
            report.cache_hits += 1;
        } else {
            report.network += 1;
        }
        if payload.storage_error.is_some() {
            report.storage_errors += 1;
        }
        return;
    }

    if let Some(detail) = outcome.failure() {
        report.failures.push(FailureRecord {
            key: detail.key.as_str().to_owned(),
            outcome: outcome.label(),
            status: detail.status,
            message: detail.message.clone(),
        });
    }
}

/// A TOML list of requests for `feedvault run`.
///
/// ```toml
/// [[requests]]
/// source = "fred"
/// endpoint = "series/observations"
/// params = { series_id = "CPIAUCSL", file_type = "json" }
///
/// [[requests]]
/// source = "cftc"
/// endpoint = "6dca-aqww.csv"
/// format = "text"
/// ttl_secs = 604800
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunManifest {
    #[serde(default)]
    pub requests: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub source: SourceId,
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default = "default_allow_cache")]
    pub allow_cache: bool,
    pub ttl_secs: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub format: PayloadFormat,
}

const fn default_allow_cache() -> bool {
    true
}

impl RunManifest {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|error| ConfigError::Parse(error.to_string()))
    }

    /// Build jobs, attaching whatever credential `credential_for` returns
    /// for each source.
    pub fn into_jobs<F>(self, credential_for: F) -> Result<Vec<FetchJob>, ValidationError>
    where
        F: Fn(SourceId) -> Option<Credential>,
    {
        self.requests
            .into_iter()
            .map(|entry| {
                let mut request =
                    RequestDescriptor::new(entry.source, &entry.endpoint)?.with_params(entry.params);
                if let Some(credential) = credential_for(entry.source) {
                    request = request.with_credential(credential);
                }

                Ok(FetchJob {
                    request,
                    options: FetchOptions {
                        allow_cache: entry.allow_cache,
                        max_retries: entry.max_retries,
                        ttl: entry.ttl_secs.map(Duration::from_secs),
                        format: entry.format,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_builds_jobs_with_options_and_credentials() {
        let manifest = RunManifest::from_toml_str(
            r#"
            [[requests]]
            source = "fred"
            endpoint = "series/observations"
            params = { series_id = "CPIAUCSL" }

            [[requests]]
            source = "cftc"
            endpoint = "6dca-aqww.csv"
            format = "text"
            allow_cache = false
            ttl_secs = 604800
            "#,
        )
        .expect("manifest parses");

        let jobs = manifest
            .into_jobs(|source| {
                (source == SourceId::Fred).then(|| Credential::QueryParam {
                    name: String::from("api_key"),
                    value: String::from("k"),
                })
            })
            .expect("valid jobs");

        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].request.has_credential());
        assert_eq!(jobs[0].options, FetchOptions::default());
        assert!(!jobs[1].request.has_credential());
        assert_eq!(jobs[1].options.format, PayloadFormat::Text);
        assert!(!jobs[1].options.allow_cache);
        assert_eq!(jobs[1].options.ttl, Some(Duration::from_secs(604_800)));
    }

    #[test]
    fn manifest_rejects_bad_endpoints() {
        let manifest = RunManifest::from_toml_str(
            "[[requests]]\nsource = \"sec\"\nendpoint = \"  \"\n",
        )
        .expect("manifest parses");

        assert_eq!(
            manifest.into_jobs(|_| None).map(|jobs| jobs.len()),
            Err(ValidationError::EmptyEndpoint)
        );
    }

    #[test]
    fn threshold_counts_failures_strictly_above_the_limit() {
        let failing = SourceReport {
            failures: vec![
                FailureRecord {
                    key: String::from("a"),
                    outcome: "transient_error",
                    status: Some(503),
                    message: String::from("HTTP 503"),
                };
                2
            ],
            ..SourceReport::default()
        };
        let mut report = RunReport {
            run_id: Uuid::nil(),
            started_at: OffsetDateTime::UNIX_EPOCH,
            finished_at: OffsetDateTime::UNIX_EPOCH,
            failure_threshold: 2,
            cancelled: false,
            sources: BTreeMap::from([(SourceId::Fred, failing), (SourceId::Ecb, SourceReport::default())]),
        };

        assert!(!report.threshold_exceeded());
        report.failure_threshold = 1;
        assert_eq!(report.sources_over_threshold(), vec![SourceId::Fred]);
    }
}

//! # Feedvault Core
//!
//! Rate-limited, persistent, cache-first fetch layer for financial data APIs.
//!
//! ## Overview
//!
//! Every provider call goes through a [`FetchClient`], which:
//!
//! - answers from the persistent cache when a fresh response is stored,
//! - otherwise waits for the source's [`RateLimiter`] budget,
//! - performs the HTTP call and classifies the result,
//! - retries throttled and transient failures with capped exponential backoff,
//! - writes successful payloads back to the cache before returning them.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Cache seam over the `DuckDB` store, plus an in-memory cache |
//! | [`clock`] | Injectable time source and sleep |
//! | [`config`] | File/env configuration and validation |
//! | [`error`] | Error types |
//! | [`fetch`] | The fetch state machine |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`outcome`] | Fetch outcomes and response classification |
//! | [`pipeline`] | Per-source batch runs and run reports |
//! | [`policy`] | Per-source limits, ttls and retry settings |
//! | [`rate_limit`] | Rolling-window rate limiter |
//! | [`request`] | Request descriptors and cache keys |
//! | [`retry`] | Backoff schedule |
//! | [`source`] | Provider identifiers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use feedvault_core::{FetchClient, FetchOptions, RequestDescriptor, SourceId};
//! use feedvault_store::CacheStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = FetchClient::new(Arc::new(CacheStore::open_default()?));
//! let request = RequestDescriptor::new(SourceId::Fred, "series/observations")?
//!     .with_param("series_id", "CPIAUCSL")
//!     .with_param("file_type", "json");
//!
//! let payload = client
//!     .fetch(&request, &FetchOptions::default())
//!     .await?
//!     .into_result()?;
//! println!("{} bytes", payload.body.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Provider failures are values, not errors: `fetch` returns
//! [`FetchOutcome::RateLimited`], [`FetchOutcome::TransientError`] or
//! [`FetchOutcome::PermanentError`] and leaves the fallback decision to the
//! caller, who may still read a stale entry with
//! [`FetchClient::get_stale_if_present`]. `Err` is returned only for invalid
//! configuration and cancellation.
//!
//! ## Security
//!
//! Credentials attached to a [`RequestDescriptor`] never enter cache keys,
//! `Debug` output or log lines, and transport errors are stripped of URLs.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http_client;
pub mod outcome;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod request;
pub mod retry;
pub mod source;

pub use cache::{MemoryCache, ResponseCache};
pub use clock::{Clock, SystemClock};
#[cfg(any(test, feature = "test-support"))]
pub use clock::ManualClock;
pub use config::{FeedConfig, SourceOverrides, DEFAULT_FAILURE_THRESHOLD};
pub use error::{ConfigError, FetchError, FetchErrorKind, ValidationError};
pub use fetch::{FetchClient, FetchClientBuilder, FetchOptions};
pub use http_client::{
    HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient, TransportFailure,
};
pub use outcome::{FailureDetail, FetchOutcome, Payload, PayloadFormat};
pub use pipeline::{
    run_sources, FailureRecord, FetchJob, ManifestEntry, RunManifest, RunReport, SourceReport,
};
pub use policy::{SourcePolicies, SourcePolicy};
pub use rate_limit::{Permit, RateBudget, RateLimit, RateLimiter};
pub use request::{parse_param, CacheKey, Credential, RequestDescriptor};
pub use retry::{Backoff, RetryPolicy};
pub use source::SourceId;

pub use feedvault_store::{CacheEntry, CacheStats, CacheStore, StoreConfig, StoreError};

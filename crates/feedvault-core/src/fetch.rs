//! Cache-first, rate-limited fetching.
//!
//! [`FetchClient::fetch`] runs each request through a fixed sequence:
//!
//! ```text
//! CacheCheck ──fresh──▶ CacheHit
//!     │ miss / stale / bypass
//!     ▼
//! PermitWait ──▶ NetworkAttempt ──2xx ok──▶ CacheWrite ──▶ NetworkSuccess
//!     ▲                │
//!     │                ├─ 429 / throttle marker ─┐
//!     │                ├─ timeout / 408 / 5xx ───┤
//!     │                └─ other 4xx ──▶ PermanentError
//!     │                                          ▼
//!     └────────── backoff sleep ◀── retries left? ── no ──▶ RateLimited / TransientError
//! ```
//!
//! Permit waits and backoff sleeps end early when the client's cancellation
//! token fires. Cache failures never fail a fetch: they are logged and the
//! request proceeds against the network only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use feedvault_store::CacheEntry;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::clock::{Clock, SystemClock};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::outcome::{classify_attempt, FetchOutcome, Payload, PayloadFormat};
use crate::policy::{SourcePolicies, SourcePolicy};
use crate::rate_limit::{Permit, RateBudget, RateLimiter};
use crate::request::{CacheKey, RequestDescriptor};
use crate::retry::RetryPolicy;
use crate::{FetchError, SourceId};

/// Per-call knobs for [`FetchClient::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Serve a fresh cached entry instead of calling the network.
    pub allow_cache: bool,
    /// Overrides the source policy's retry count.
    pub max_retries: Option<u32>,
    /// Overrides the source policy's ttl for this endpoint.
    pub ttl: Option<Duration>,
    pub format: PayloadFormat,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_cache: true,
            max_retries: None,
            ttl: None,
            format: PayloadFormat::Json,
        }
    }
}

impl FetchOptions {
    pub fn refresh(mut self) -> Self {
        self.allow_cache = false;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }
}

struct FetchInner {
    cache: Arc<dyn ResponseCache>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    policies: SourcePolicies,
    limiters: BTreeMap<SourceId, Arc<RateLimiter>>,
    cancel: CancellationToken,
}

/// Shared fetch entry point. Cheap to clone; clones share rate budgets.
#[derive(Clone)]
pub struct FetchClient {
    inner: Arc<FetchInner>,
}

/// Builder for [`FetchClient`].
pub struct FetchClientBuilder {
    cache: Arc<dyn ResponseCache>,
    http: Option<Arc<dyn HttpClient>>,
    clock: Option<Arc<dyn Clock>>,
    policies: SourcePolicies,
    limiters: BTreeMap<SourceId, Arc<RateLimiter>>,
    cancel: Option<CancellationToken>,
}

impl FetchClientBuilder {
    pub fn http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn policies(mut self, policies: SourcePolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Use an existing limiter for its source instead of building one from
    /// the policy.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiters.insert(limiter.source(), limiter);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> FetchClient {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut limiters = self.limiters;
        for policy in self.policies.iter() {
            limiters.entry(policy.source).or_insert_with(|| {
                Arc::new(RateLimiter::new(policy.source, policy.rate_limit, clock.clone()))
            });
        }

        FetchClient {
            inner: Arc::new(FetchInner {
                cache: self.cache,
                http: self
                    .http
                    .unwrap_or_else(|| Arc::new(ReqwestHttpClient::default())),
                clock,
                policies: self.policies,
                limiters,
                cancel: self.cancel.unwrap_or_default(),
            }),
        }
    }
}

impl FetchClient {
    pub fn builder(cache: Arc<dyn ResponseCache>) -> FetchClientBuilder {
        FetchClientBuilder {
            cache,
            http: None,
            clock: None,
            policies: SourcePolicies::default(),
            limiters: BTreeMap::new(),
            cancel: None,
        }
    }

    /// Client with default policies, the reqwest transport and real time.
    pub fn new(cache: Arc<dyn ResponseCache>) -> Self {
        Self::builder(cache).build()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn policy(&self, source: SourceId) -> Result<&SourcePolicy, FetchError> {
        Ok(self.inner.policies.get(source)?)
    }

    pub async fn rate_budget(&self, source: SourceId) -> Result<RateBudget, FetchError> {
        Ok(self.limiter(source)?.snapshot().await)
    }

    /// Fetch `request`, preferring a fresh cached response.
    ///
    /// Provider failures come back as `Ok` outcomes. `Err` is reserved for
    /// configuration problems and cancellation.
    ///
    /// When the cache read itself fails, the network payload is returned
    /// without being written back, and the read error is reported in
    /// `storage_error`.
    pub async fn fetch(
        &self,
        request: &RequestDescriptor,
        options: &FetchOptions,
    ) -> Result<FetchOutcome, FetchError> {
        let source = request.source();
        let policy = self.inner.policies.get(source)?;
        let limiter = self.limiter(source)?;
        let key = request.cache_key();
        let ttl = options.ttl.unwrap_or_else(|| policy.ttl_for(request.endpoint()));
        let retry = match options.max_retries {
            Some(max_retries) => RetryPolicy {
                max_retries,
                ..policy.retry
            },
            None => policy.retry,
        };

        if self.inner.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let mut storage_error = None;
        let mut write_back = true;
        if options.allow_cache {
            match self.inner.cache.get(key.as_str()) {
                Ok(Some(entry)) if self.serves_as_hit(&entry, ttl) => {
                    debug!(source = %source, key = %key, "cache hit");
                    return Ok(FetchOutcome::CacheHit(Payload {
                        key,
                        body: entry.payload,
                        fetched_at: entry.fetched_at,
                        attempts: 0,
                        storage_error: None,
                    }));
                }
                Ok(Some(_)) => debug!(source = %source, key = %key, "cache entry stale"),
                Ok(None) => debug!(source = %source, key = %key, "cache miss"),
                Err(error) => {
                    warn!(
                        source = %source,
                        key = %key,
                        error = %error,
                        "cache read failed; fetching from network without write-back"
                    );
                    storage_error = Some(error.to_string());
                    write_back = false;
                }
            }
        }

        let mut attempt: u32 = 0;
        let mut previous_delay = Duration::ZERO;
        loop {
            attempt += 1;
            let permit = self.acquire_permit(&limiter).await?;
            if !permit.waited.is_zero() {
                debug!(
                    source = %source,
                    waited_ms = millis(permit.waited),
                    "rate budget permit granted after wait"
                );
            }

            let result = self
                .inner
                .http
                .execute(request.http_request(
                    &policy.base_url,
                    Duration::from_millis(policy.request_timeout_ms),
                ))
                .await;

            let failure = match classify_attempt(policy, options.format, result) {
                Ok(body) => {
                    let fetched_at = self.inner.clock.now();
                    let written = if write_back {
                        self.write_entry(request, &key, &body, fetched_at, ttl)
                    } else {
                        Ok(())
                    };
                    if let Err(error) = written {
                        warn!(
                            source = %source,
                            key = %key,
                            error = %error,
                            "cache write failed; returning uncached payload"
                        );
                        storage_error = Some(error.to_string());
                    }
                    info!(source = %source, key = %key, attempts = attempt, "fetched from network");
                    return Ok(FetchOutcome::NetworkSuccess(Payload {
                        key,
                        body,
                        fetched_at,
                        attempts: attempt,
                        storage_error,
                    }));
                }
                Err(failure) => failure,
            };

            if !failure.retryable() || attempt > retry.max_retries {
                warn!(
                    source = %source,
                    key = %key,
                    attempts = attempt,
                    status = failure.status,
                    error = %failure.message,
                    "fetch failed"
                );
                return Ok(failure.into_outcome(source, key, attempt));
            }

            // A Retry-After hint raises the floor for every later attempt.
            let delay = retry
                .backoff
                .delay_with_hint(attempt - 1, failure.retry_after)
                .max(previous_delay);
            previous_delay = delay;
            info!(
                source = %source,
                key = %key,
                attempt,
                delay_ms = millis(delay),
                error = %failure.message,
                "retrying after backoff"
            );
            self.sleep_or_cancel(delay).await?;
        }
    }

    /// Stored entry for `request`, fresh or stale, exactly as persisted.
    pub fn get_stale_if_present(
        &self,
        request: &RequestDescriptor,
    ) -> Result<Option<CacheEntry>, FetchError> {
        Ok(self.inner.cache.get(request.cache_key().as_str())?)
    }

    /// Drop the cached entry for `request`, e.g. after its payload failed to
    /// decode downstream.
    pub fn invalidate(&self, request: &RequestDescriptor) -> Result<bool, FetchError> {
        let key = request.cache_key();
        let removed = self.inner.cache.invalidate(key.as_str())?;
        if removed {
            info!(source = %request.source(), key = %key, "cache entry invalidated");
        }
        Ok(removed)
    }

    fn limiter(&self, source: SourceId) -> Result<Arc<RateLimiter>, FetchError> {
        self.inner
            .limiters
            .get(&source)
            .cloned()
            .ok_or(FetchError::Configuration(crate::ConfigError::MissingPolicy {
                provider: source,
            }))
    }

    /// Fresh against both the ttl it was written with and the ttl in force now.
    fn serves_as_hit(&self, entry: &CacheEntry, ttl: Duration) -> bool {
        entry.is_fresh_within(self.inner.clock.now(), entry.ttl_seconds.min(ttl.as_secs()))
    }

    async fn acquire_permit(&self, limiter: &RateLimiter) -> Result<Permit, FetchError> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(FetchError::Cancelled),
            permit = limiter.acquire() => Ok(permit?),
        }
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> Result<(), FetchError> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(FetchError::Cancelled),
            () = self.inner.clock.sleep(delay) => Ok(()),
        }
    }

    fn write_entry(
        &self,
        request: &RequestDescriptor,
        key: &CacheKey,
        body: &str,
        fetched_at: OffsetDateTime,
        ttl: Duration,
    ) -> Result<(), feedvault_store::StoreError> {
        self.inner.cache.put(&CacheEntry {
            key: key.as_str().to_owned(),
            payload: body.to_owned(),
            fetched_at,
            ttl_seconds: ttl.as_secs(),
            source: request.source().as_str().to_owned(),
            endpoint: request.endpoint().to_owned(),
        })
    }
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("policies", &self.inner.policies)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::http_client::{HttpError, HttpRequest, HttpResponse};

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<HttpResponse, HttpError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls mutex poisoned")
        }
    }

    impl HttpClient for Scripted {
        fn execute<'a>(
            &'a self,
            _request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            *self.calls.lock().expect("calls mutex poisoned") += 1;
            let next = self
                .responses
                .lock()
                .expect("responses mutex poisoned")
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::connect("script exhausted")));
            Box::pin(async move { next })
        }
    }

    fn client(http: Arc<Scripted>) -> (Arc<ManualClock>, Arc<MemoryCache>, FetchClient) {
        let clock = Arc::new(ManualClock::starting_at_epoch_2024());
        let cache = Arc::new(MemoryCache::new());
        let client = FetchClient::builder(cache.clone())
            .http_client(http)
            .clock(clock.clone())
            .build();
        (clock, cache, client)
    }

    fn quote() -> RequestDescriptor {
        RequestDescriptor::new(SourceId::Finnhub, "quote")
            .expect("valid endpoint")
            .with_param("symbol", "AAPL")
    }

    #[tokio::test]
    async fn refresh_skips_a_fresh_entry() {
        let http = Scripted::new(vec![
            Ok(HttpResponse::ok(r#"{"c":1}"#)),
            Ok(HttpResponse::ok(r#"{"c":2}"#)),
        ]);
        let (_, _, client) = client(http.clone());

        client.fetch(&quote(), &FetchOptions::default()).await.expect("first");
        let outcome = client
            .fetch(&quote(), &FetchOptions::default().refresh())
            .await
            .expect("refresh");

        assert_eq!(http.calls(), 2);
        assert_eq!(outcome.payload().map(|p| p.body.as_str()), Some(r#"{"c":2}"#));
    }

    #[tokio::test]
    async fn shorter_requested_ttl_makes_an_entry_stale() {
        let http = Scripted::new(vec![
            Ok(HttpResponse::ok(r#"{"c":1}"#)),
            Ok(HttpResponse::ok(r#"{"c":2}"#)),
        ]);
        let (clock, _, client) = client(http.clone());

        client.fetch(&quote(), &FetchOptions::default()).await.expect("first");
        clock.advance(Duration::from_secs(120));
        let outcome = client
            .fetch(&quote(), &FetchOptions::default().with_ttl(Duration::from_secs(60)))
            .await
            .expect("second");

        assert!(matches!(outcome, FetchOutcome::NetworkSuccess(_)));
        assert_eq!(http.calls(), 2);
    }

    #[tokio::test]
    async fn retry_after_raises_the_backoff_delay() {
        let http = Scripted::new(vec![
            Ok(HttpResponse::new(429, "").with_retry_after(Duration::from_secs(7))),
            Ok(HttpResponse::ok("{}")),
        ]);
        let (clock, _, client) = client(http);

        let outcome = client.fetch(&quote(), &FetchOptions::default()).await.expect("fetch");

        assert!(outcome.is_success());
        assert!(clock.sleeps().contains(&Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn backoff_never_drops_below_an_earlier_retry_after() {
        let http = Scripted::new(vec![
            Ok(HttpResponse::new(503, "").with_retry_after(Duration::from_secs(10))),
            Ok(HttpResponse::new(503, "")),
            Ok(HttpResponse::new(503, "")),
            Ok(HttpResponse::new(503, "")),
        ]);
        let (clock, _, client) = client(http.clone());

        let outcome = client.fetch(&quote(), &FetchOptions::default()).await.expect("fetch");

        assert!(!outcome.is_success());
        assert_eq!(http.calls(), 4);
        let sleeps = clock.sleeps();
        assert_eq!(sleeps, vec![Duration::from_secs(10); 3]);
        assert!(sleeps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    /// Reads fail; writes are counted.
    #[derive(Default)]
    struct UnreadableCache {
        puts: Mutex<u32>,
    }

    impl ResponseCache for UnreadableCache {
        fn get(&self, key: &str) -> Result<Option<CacheEntry>, feedvault_store::StoreError> {
            Err(feedvault_store::StoreError::ChecksumMismatch {
                key: key.to_owned(),
            })
        }

        fn put(&self, _entry: &CacheEntry) -> Result<(), feedvault_store::StoreError> {
            *self.puts.lock().expect("puts mutex poisoned") += 1;
            Ok(())
        }

        fn invalidate(&self, _key: &str) -> Result<bool, feedvault_store::StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn failed_cache_read_skips_the_write_back() {
        let http = Scripted::new(vec![Ok(HttpResponse::ok(r#"{"c":1}"#))]);
        let cache = Arc::new(UnreadableCache::default());
        let client = FetchClient::builder(cache.clone())
            .http_client(http)
            .clock(Arc::new(ManualClock::starting_at_epoch_2024()))
            .build();

        let outcome = client.fetch(&quote(), &FetchOptions::default()).await.expect("fetch");

        let payload = outcome.payload().expect("network payload");
        assert_eq!(payload.body, r#"{"c":1}"#);
        assert!(payload
            .storage_error
            .as_deref()
            .is_some_and(|error| error.contains("checksum")));
        assert_eq!(*cache.puts.lock().expect("puts mutex poisoned"), 0);
    }

    #[tokio::test]
    async fn refresh_still_writes_when_the_read_is_skipped() {
        let http = Scripted::new(vec![Ok(HttpResponse::ok("{}"))]);
        let cache = Arc::new(UnreadableCache::default());
        let client = FetchClient::builder(cache.clone())
            .http_client(http)
            .clock(Arc::new(ManualClock::starting_at_epoch_2024()))
            .build();

        client
            .fetch(&quote(), &FetchOptions::default().refresh())
            .await
            .expect("fetch");

        assert_eq!(*cache.puts.lock().expect("puts mutex poisoned"), 1);
    }

    #[tokio::test]
    async fn cancelled_client_refuses_to_fetch() {
        let http = Scripted::new(vec![Ok(HttpResponse::ok("{}"))]);
        let (_, _, client) = client(http.clone());

        client.cancellation_token().cancel();
        let error = client
            .fetch(&quote(), &FetchOptions::default())
            .await
            .expect_err("cancelled");

        assert!(matches!(error, FetchError::Cancelled));
        assert_eq!(http.calls(), 0);
    }

    #[tokio::test]
    async fn missing_policy_is_a_configuration_error() {
        let http = Scripted::new(Vec::new());
        let client = FetchClient::builder(Arc::new(MemoryCache::new()))
            .http_client(http)
            .clock(Arc::new(ManualClock::starting_at_epoch_2024()))
            .policies(SourcePolicies::empty().with_policy(SourcePolicy::fred_default()))
            .build();

        let error = client
            .fetch(&quote(), &FetchOptions::default())
            .await
            .expect_err("no finnhub policy");

        assert!(matches!(error, FetchError::Configuration(_)));
    }

    #[tokio::test]
    async fn invalidate_removes_the_stored_entry() {
        let http = Scripted::new(vec![Ok(HttpResponse::ok("{}"))]);
        let (_, cache, client) = client(http);

        client.fetch(&quote(), &FetchOptions::default()).await.expect("fetch");
        assert_eq!(cache.len(), 1);

        assert!(client.invalidate(&quote()).expect("invalidate"));
        assert!(client.get_stale_if_present(&quote()).expect("lookup").is_none());
    }
}

//! Shared fixtures for the behaviour tests: a scripted transport that records
//! every call against the injected clock, client builders, and a way to run
//! part of a test in a second process.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedvault_core::{
    Clock, FetchClient, HttpClient, HttpError, HttpRequest, HttpResponse, ManualClock,
    RateLimit, RequestDescriptor, ResponseCache, SourceId, SourcePolicies, SourcePolicy,
};
use time::OffsetDateTime;

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Call {
    pub url: String,
    pub at: OffsetDateTime,
}

/// Transport that replays queued responses, then falls back to a responder.
pub struct ScriptedHttp {
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    fallback: Responder,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedHttp {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(|_| Err(HttpError::connect("no scripted response left"))),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue one response.
    pub fn then(self, response: Result<HttpResponse, HttpError>) -> Self {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(response);
        self
    }

    /// Answer every call past the script with `responder`.
    pub fn otherwise<F>(mut self, responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    {
        self.fallback = Box::new(responder);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls mutex poisoned").len()
    }
}

impl HttpClient for ScriptedHttp {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        self.calls.lock().expect("calls mutex poisoned").push(Call {
            url: request.url.clone(),
            at: self.clock.now(),
        });
        let scripted = self.script.lock().expect("script mutex poisoned").pop_front();
        let response = scripted.unwrap_or_else(|| (self.fallback)(&request));
        Box::pin(async move { response })
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at_epoch_2024())
}

/// Policy with no spacing floor and the given per-minute quota, so the only
/// sleeps a test observes come from the window or from backoff.
pub fn unspaced_policy(source: SourceId, max_calls_per_minute: i64) -> SourcePolicy {
    let mut policy = SourcePolicy::default_for(source);
    policy.rate_limit = RateLimit::per_minute(max_calls_per_minute, Duration::ZERO);
    policy
}

pub fn client_with(
    cache: Arc<dyn ResponseCache>,
    http: Arc<ScriptedHttp>,
    clock: Arc<ManualClock>,
    policies: SourcePolicies,
) -> FetchClient {
    FetchClient::builder(cache)
        .http_client(http)
        .clock(clock)
        .policies(policies)
        .build()
}

pub fn fred_series(id: &str) -> RequestDescriptor {
    RequestDescriptor::new(SourceId::Fred, "series/observations")
        .expect("valid endpoint")
        .with_param("series_id", id)
        .with_param("file_type", "json")
}

pub fn finnhub_quote(symbol: &str) -> RequestDescriptor {
    RequestDescriptor::new(SourceId::Finnhub, "quote")
        .expect("valid endpoint")
        .with_param("symbol", symbol)
}

pub fn observations(value: &str) -> String {
    format!(r#"{{"observations":[{{"date":"2024-01-01","value":"{value}"}}]}}"#)
}

/// Role a re-executed test binary plays; unset in the parent.
const CHILD_ROLE_ENV: &str = "FEEDVAULT_TEST_CHILD_ROLE";
const CHILD_DB_ENV: &str = "FEEDVAULT_TEST_CHILD_DB";

/// Role and cache path handed to this process by [`spawn_child`].
pub fn child_role() -> Option<(String, PathBuf)> {
    let role = std::env::var(CHILD_ROLE_ENV).ok()?;
    let path = std::env::var_os(CHILD_DB_ENV)?;
    Some((role, PathBuf::from(path)))
}

/// Run `test_name` from this test binary in a separate process. The test
/// sees its role through [`child_role`] and must exit instead of running the
/// parent side.
pub fn spawn_child(test_name: &str, role: &str, db_path: &Path) -> Child {
    let binary = std::env::current_exe().expect("test binary path");
    Command::new(binary)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ROLE_ENV, role)
        .env(CHILD_DB_ENV, db_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn child test process")
}

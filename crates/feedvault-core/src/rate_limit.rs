//! Per-source request budgets.
//!
//! Each [`RateLimiter`] enforces two layers for one provider:
//!
//! 1. a rolling-window cap: at most `max_calls` grants within any window of
//!    length `window`;
//! 2. a spacing floor: consecutive grants are at least `min_spacing` apart.
//!
//! `acquire` suspends until both hold. Waiters are served in arrival order
//! because the budget lock is a fair tokio mutex held for the whole wait.
//! Dropping an `acquire` future mid-wait consumes no budget.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::{ConfigError, SourceId};

/// Longest accepted rolling window.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Longest accepted spacing floor.
pub const MAX_MIN_SPACING: Duration = Duration::from_secs(60 * 60);

/// Budget limits for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Grants allowed per window. Zero or negative is a configuration error
    /// reported by `acquire`.
    pub max_calls: i64,
    pub window: Duration,
    pub min_spacing: Duration,
}

impl RateLimit {
    pub const fn per_minute(max_calls: i64, min_spacing: Duration) -> Self {
        Self {
            max_calls,
            window: Duration::from_secs(60),
            min_spacing,
        }
    }

    /// Check the limits for `provider` and return the quota as a count.
    pub fn validate(&self, provider: SourceId) -> Result<usize, ConfigError> {
        let max_calls = usize::try_from(self.max_calls)
            .ok()
            .filter(|&max| max > 0)
            .ok_or(ConfigError::NonPositiveQuota {
                provider,
                value: self.max_calls,
            })?;
        if self.window.is_zero() {
            return Err(ConfigError::ZeroValue {
                provider,
                field: "window_secs",
            });
        }
        if self.window > MAX_WINDOW {
            return Err(ConfigError::OutOfRange {
                provider,
                field: "window_secs",
                value: self.window.as_secs(),
                max: MAX_WINDOW.as_secs(),
            });
        }
        if self.min_spacing > MAX_MIN_SPACING {
            return Err(ConfigError::OutOfRange {
                provider,
                field: "min_spacing_ms",
                value: u64::try_from(self.min_spacing.as_millis()).unwrap_or(u64::MAX),
                max: u64::try_from(MAX_MIN_SPACING.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(max_calls)
    }
}

/// Point-in-time view of a source's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateBudget {
    /// Oldest grant still inside the rolling window.
    pub window_start: Option<OffsetDateTime>,
    pub calls_in_window: usize,
    pub max_calls_per_window: i64,
    pub min_spacing_ms: u128,
    pub last_call_at: Option<OffsetDateTime>,
    /// Grants since the limiter was created.
    pub total_granted: u64,
    /// Time spent suspended waiting for budget.
    pub total_waited: Duration,
}

/// Proof that a request may go out now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub granted_at: OffsetDateTime,
    pub waited: Duration,
}

#[derive(Debug, Default)]
struct BudgetState {
    calls: VecDeque<OffsetDateTime>,
    last_call_at: Option<OffsetDateTime>,
    total_granted: u64,
    total_waited: Duration,
}

impl BudgetState {
    fn evict(&mut self, now: OffsetDateTime, window: Duration) {
        while let Some(&oldest) = self.calls.front() {
            if deadline(oldest, window).is_some_and(|end| end <= now) {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time still to wait before a grant at `now` would respect both layers.
    fn required_wait(&self, now: OffsetDateTime, limit: &RateLimit, max_calls: usize) -> Duration {
        let window_wait = if self.calls.len() >= max_calls {
            self.calls
                .front()
                .map(|&oldest| until_after(oldest, limit.window, now))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        let spacing_wait = self
            .last_call_at
            .map(|last| until_after(last, limit.min_spacing, now))
            .unwrap_or(Duration::ZERO);

        window_wait.max(spacing_wait)
    }

    fn record(&mut self, now: OffsetDateTime) {
        self.calls.push_back(now);
        self.last_call_at = Some(now);
        self.total_granted = self.total_granted.saturating_add(1);
    }
}

/// `None` when `at + span` is not representable.
fn deadline(at: OffsetDateTime, span: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(span)
        .ok()
        .and_then(|span| at.checked_add(span))
}

/// Time from `now` until `span` after `at`. Unrepresentable deadlines clamp
/// to `span`; `validate` keeps limits well inside range.
fn until_after(at: OffsetDateTime, span: Duration, now: OffsetDateTime) -> Duration {
    match deadline(at, span) {
        Some(end) => Duration::try_from(end - now).unwrap_or(Duration::ZERO),
        None => span,
    }
}

/// Rolling-window plus spacing limiter for a single source.
pub struct RateLimiter {
    source: SourceId,
    limit: RateLimit,
    clock: Arc<dyn Clock>,
    state: Mutex<BudgetState>,
}

impl RateLimiter {
    pub fn new(source: SourceId, limit: RateLimit, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            limit,
            clock,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub const fn source(&self) -> SourceId {
        self.source
    }

    pub const fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Wait until a request to this source is within budget.
    ///
    /// Fails fast, without waiting, when the limits are out of range.
    pub async fn acquire(&self) -> Result<Permit, ConfigError> {
        let max_calls = self.limit.validate(self.source)?;

        let mut state = self.state.lock().await;
        let mut waited = Duration::ZERO;

        loop {
            let now = self.clock.now();
            state.evict(now, self.limit.window);

            let wait = state.required_wait(now, &self.limit, max_calls);
            if wait.is_zero() {
                state.record(now);
                state.total_waited += waited;
                return Ok(Permit {
                    granted_at: now,
                    waited,
                });
            }

            debug!(
                source = %self.source,
                wait_ms = wait.as_millis() as u64,
                calls_in_window = state.calls.len(),
                "waiting for rate budget"
            );
            self.clock.sleep(wait).await;
            waited += wait;
        }
    }

    pub async fn snapshot(&self) -> RateBudget {
        let mut state = self.state.lock().await;
        state.evict(self.clock.now(), self.limit.window);

        RateBudget {
            window_start: state.calls.front().copied(),
            calls_in_window: state.calls.len(),
            max_calls_per_window: self.limit.max_calls,
            min_spacing_ms: self.limit.min_spacing.as_millis(),
            last_call_at: state.last_call_at,
            total_granted: state.total_granted,
            total_waited: state.total_waited,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("source", &self.source)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

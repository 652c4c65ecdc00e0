//! Time source and suspension abstraction.
//!
//! Everything in the fetch layer that reads the time or waits goes through a
//! [`Clock`], so rate limiting and backoff can be exercised against a
//! virtual clock without real delays. `ManualClock` is compiled for tests and
//! behind the `test-support` feature.

use std::future::Future;
use std::pin::Pin;
#[cfg(any(test, feature = "test-support"))]
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    /// Current UTC wall-clock time.
    fn now(&self) -> OffsetDateTime;

    /// Suspend the calling task for `duration`.
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Real time backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(any(test, feature = "test-support"))]
#[derive(Debug)]
struct ManualState {
    now: OffsetDateTime,
    sleeps: Vec<Duration>,
}

/// Virtual clock: `sleep` returns immediately after advancing time by the
/// requested amount, and every sleep is recorded.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[cfg(any(test, feature = "test-support"))]
impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: Vec::new(),
            }),
        }
    }

    /// Clock starting at 2024-01-02T00:00:00Z.
    pub fn starting_at_epoch_2024() -> Self {
        Self::new(
            OffsetDateTime::from_unix_timestamp(1_704_153_600)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        )
    }

    /// Move time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().expect("manual clock mutex poisoned");
        state.now += duration;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .expect("manual clock mutex poisoned")
            .sleeps
            .clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.state.lock().expect("manual clock mutex poisoned").now
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        {
            let mut state = self.state.lock().expect("manual clock mutex poisoned");
            state.now += duration;
            state.sleeps.push(duration);
        }
        Box::pin(tokio::task::yield_now())
    }
}

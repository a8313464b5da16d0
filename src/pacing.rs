//! Request pacing, retry backoff and cooperative cancellation for the
//! sequential dispatcher.

use std::thread;
use std::time::{Duration, Instant};

/// Decides how long to wait before the next request may start.
pub trait RequestPacer {
    /// Blocks until the next request is allowed.
    fn wait_turn(&mut self);

    /// Records that a request (successful or not) just finished.
    fn record_completion(&mut self);
}

/// Enforces a fixed minimum gap between the end of one request and the start
/// of the next. The first request never waits.
#[derive(Debug, Clone)]
pub struct MinIntervalPacer {
    interval: Duration,
    last_completed: Option<Instant>,
}

impl MinIntervalPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_completed: None,
        }
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_completed {
            Some(last) => self.interval.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

impl RequestPacer for MinIntervalPacer {
    fn wait_turn(&mut self) {
        let remaining = self.remaining_at(Instant::now());
        if !remaining.is_zero() {
            tracing::debug!(wait_ms = remaining.as_millis(), "pacing next request");
            thread::sleep(remaining);
        }
    }

    fn record_completion(&mut self) {
        self.last_completed = Some(Instant::now());
    }
}

/// Bounded retry with exponential backoff. `max_attempts == 1` means a failed
/// request fails immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 2.0,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_backoff, self.max_backoff, self.multiplier)
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            max,
            multiplier,
            current: initial,
        }
    }

    /// Saturates at `max`, also when the multiplier is negative, NaN or so
    /// large that the product is not a representable duration.
    pub fn next_delay(&mut self) -> Duration {
        let delay = std::cmp::min(self.current, self.max);
        let scaled = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(self.max, scaled);
        delay
    }
}

/// Stops dispatch once an optional deadline has passed. Checked between
/// windows only, never during a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelToken {
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that never trips.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

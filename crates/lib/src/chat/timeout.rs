//! Login session timer. The start instant is explicit state with an injected clock.

use chrono::{DateTime, Duration, Utc};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Largest timeout chrono can represent, in minutes.
const MAX_TIMEOUT_MINUTES: i64 = i64::MAX / 60_000;

#[derive(Debug)]
pub struct SessionTimer<C: Clock = SystemClock> {
    clock: C,
    timeout: Duration,
    started_at: Option<DateTime<Utc>>,
}

impl SessionTimer<SystemClock> {
    pub fn from_minutes(minutes: u64) -> Self {
        let minutes = i64::try_from(minutes).unwrap_or(i64::MAX).min(MAX_TIMEOUT_MINUTES);
        Self::new(SystemClock, Duration::minutes(minutes))
    }
}

impl<C: Clock> SessionTimer<C> {
    pub fn new(clock: C, timeout: Duration) -> Self {
        Self {
            clock,
            timeout,
            started_at: None,
        }
    }

    /// Record the start instant. A running timer keeps its original start.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(self.clock.now());
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time left before expiry; `None` when the timer was never started.
    pub fn remaining(&self) -> Option<Duration> {
        let started = self.started_at?;
        let Some(deadline) = started.checked_add_signed(self.timeout) else {
            return Some(self.timeout);
        };
        let left = deadline - self.clock.now();
        Some(left.max(Duration::zero()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().map_or(false, |left| left <= Duration::zero())
    }

    /// Forget the start instant (logout).
    pub fn clear(&mut self) {
        self.started_at = None;
    }
}

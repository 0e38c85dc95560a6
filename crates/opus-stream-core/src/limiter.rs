//! Token-bucket admission gate for new playback sessions.
//!
//! Each caller reserves the next free slot under a short lock and then sleeps
//! until that slot, so admission order follows reservation order and nobody
//! starves. The bucket is tracked as a theoretical arrival time: a request is
//! admitted immediately while that time is less than `burst` intervals ahead
//! of now.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AdmissionConfig;
use crate::error::StreamError;

/// Process-wide limiter shared by every session.
#[derive(Debug)]
pub struct AdmissionLimiter {
    interval: Duration,
    burst: u32,
    next_free: Mutex<Option<Instant>>,
}

impl AdmissionLimiter {
    /// Create a limiter that replenishes one token per `interval` with `burst` capacity.
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst: burst.max(1),
            next_free: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &AdmissionConfig) -> Self {
        Self::new(cfg.interval, cfg.burst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Wait until a token is available and consume it.
    pub async fn acquire(&self) {
        let wait = self.reserve_at(Instant::now());
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "admission delayed");
            tokio::time::sleep(wait).await;
        }
    }

    /// Like [`acquire`](Self::acquire), but refuse when the next token is further
    /// away than `limit`. A refused call consumes nothing.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<(), StreamError> {
        let wait = self
            .try_reserve_at(Instant::now(), limit)
            .ok_or(StreamError::AdmissionTimeout { limit })?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Reserve the next slot and return how long the caller must wait for it.
    fn reserve_at(&self, now: Instant) -> Duration {
        self.try_reserve_at(now, Duration::MAX)
            .unwrap_or(Duration::ZERO)
    }

    fn try_reserve_at(&self, now: Instant, limit: Duration) -> Option<Duration> {
        let mut next_free = self.next_free.lock().unwrap_or_else(|err| err.into_inner());
        let base = match *next_free {
            Some(at) if at > now => at,
            _ => now,
        };
        let wait = base
            .saturating_duration_since(now)
            .saturating_sub(self.tolerance());
        if wait > limit {
            return None;
        }
        *next_free = Some(base + self.interval);
        Some(wait)
    }

    /// How far ahead of now reservations may run before callers must wait.
    fn tolerance(&self) -> Duration {
        self.interval.saturating_mul(self.burst - 1)
    }
}

//! Per-identifier request admission.
//!
//! Fixed windows: the first call from an identifier opens a window that ends
//! `window` later, and at most `max_requests` calls are admitted inside it.
//! Rejection is immediate. A caller that spends its budget at the end of one
//! window and again at the start of the next gets up to twice the ceiling in a
//! short span; that is inherent to fixed windows.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admits per identifier per window
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub tracked_identifiers: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub max_requests: u32,
    pub window_ms: u64,
}

#[derive(Default)]
struct LimiterState {
    windows: HashMap<String, RateLimitWindow>,
    admitted: u64,
    rejected: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Count one call against `identifier`'s window; false when the ceiling
    /// is already reached
    pub fn admit(&self, identifier: &str) -> bool {
        self.admit_at(identifier, Instant::now()).is_ok()
    }

    /// Like [`RateLimiter::admit`], reporting a rejection as
    /// [`Error::RateLimitExceeded`] with the time left in the window
    pub fn check(&self, identifier: &str) -> Result<()> {
        self.admit_at(identifier, Instant::now())
            .map_err(|retry_after| {
                debug!("Rate limit exceeded for {}", identifier);
                Error::RateLimitExceeded {
                    identifier: identifier.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                }
            })
    }

    /// Returns the time until the window resets when rejected
    fn admit_at(&self, identifier: &str, now: Instant) -> std::result::Result<(), Duration> {
        let mut guard = self.state.lock();
        let LimiterState {
            windows,
            admitted,
            rejected,
        } = &mut *guard;

        let fresh = RateLimitWindow {
            count: 0,
            reset_at: now + self.config.window,
        };
        let window = windows.entry(identifier.to_string()).or_insert(fresh);
        if now >= window.reset_at {
            *window = fresh;
        }

        if window.count >= self.config.max_requests {
            *rejected += 1;
            return Err(window.reset_at.saturating_duration_since(now));
        }

        window.count += 1;
        *admitted += 1;
        Ok(())
    }

    /// Forget windows that have already ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let before = state.windows.len();
        state.windows.retain(|_, window| now < window.reset_at);
        let removed = before - state.windows.len();
        if removed > 0 {
            debug!("Discarded {} expired rate limit windows", removed);
        }
        removed
    }

    pub fn stats(&self) -> RateLimitStats {
        let state = self.state.lock();
        RateLimitStats {
            tracked_identifiers: state.windows.len(),
            admitted: state.admitted,
            rejected: state.rejected,
            max_requests: self.config.max_requests,
            window_ms: self.config.window.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_ceiling_within_window() {
        let limiter = limiter(3);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.admit_at("client", start).is_ok());
        }
        let retry_after = limiter.admit_at("client", start + Duration::from_secs(4)).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(6));

        // other identifiers have their own window
        assert!(limiter.admit_at("other", start).is_ok());

        let stats = limiter.stats();
        assert_eq!(stats.admitted, 4);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_window_reset() {
        let limiter = limiter(1);
        let start = Instant::now();

        assert!(limiter.admit_at("client", start).is_ok());
        assert!(limiter.admit_at("client", start + Duration::from_secs(9)).is_err());
        assert!(limiter.admit_at("client", start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_burst_at_window_boundary() {
        let limiter = limiter(5);
        let start = Instant::now();
        let end_of_window = start + Duration::from_millis(9_999);
        let next_window = start + Duration::from_secs(10);

        assert!(limiter.admit_at("client", start).is_ok());
        for _ in 0..4 {
            assert!(limiter.admit_at("client", end_of_window).is_ok());
        }
        for _ in 0..5 {
            assert!(limiter.admit_at("client", next_window).is_ok());
        }
    }

    #[test]
    fn test_sweep_discards_ended_windows() {
        let limiter = limiter(1);
        let start = Instant::now();
        limiter.admit_at("a", start).unwrap();
        limiter.admit_at("b", start + Duration::from_secs(5)).unwrap();

        assert_eq!(limiter.sweep_at(start + Duration::from_secs(11)), 1);
        assert_eq!(limiter.stats().tracked_identifiers, 1);
    }

    #[test]
    fn test_check_reports_retry_after() {
        let limiter = limiter(0);
        match limiter.check("client") {
            Err(Error::RateLimitExceeded { identifier, retry_after_ms }) => {
                assert_eq!(identifier, "client");
                assert!(retry_after_ms <= 10_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

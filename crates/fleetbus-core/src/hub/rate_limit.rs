//! Per-client sliding-window rate limiter.
//!
//! Each key (a client IP) keeps the instants of its recent requests. A request
//! is allowed while fewer than `max_requests` fall inside the trailing window.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default requests allowed per window.
const DEFAULT_MAX_REQUESTS: u32 = 120;

/// Default sliding window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    hits: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: DashMap::new(),
        }
    }

    /// Record a request from `key` and report whether it is within the limit.
    ///
    /// Rejected requests are not recorded, so a client that backs off regains
    /// capacity as its earlier hits age out. A limit of zero disables limiting.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let cutoff = now.checked_sub(self.window);

        let mut entry = self.hits.entry(key.to_owned()).or_default();
        let timestamps = entry.value_mut();
        if let Some(cutoff) = cutoff {
            timestamps.retain(|t| *t > cutoff);
        }

        if timestamps.len() >= self.max_requests as usize {
            return false;
        }
        timestamps.push(now);
        true
    }

    /// Drop expired timestamps and forget keys with no recent requests.
    pub fn cleanup(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        self.hits.retain(|_, timestamps| {
            timestamps.retain(|t| *t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("tracked_keys", &self.hits.len())
            .finish()
    }
}

//! Per-client sliding-window rate limiting
//!
//! One timestamp window per client IP, pruned lazily on each admission
//! check so there is no background sweeper. Loopback callers are exempt:
//! local tooling drives the daemon far harder than any remote client is
//! allowed to.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after_seconds: u64 },
}

/// Sliding-window request admission control
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<IpAddr, Vec<Instant>>,
    window: Duration,
    max_requests: usize,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    /// Check whether a request from `client` is admitted right now
    pub fn admit(&self, client: IpAddr) -> Admission {
        if client.is_loopback() {
            return Admission::Allowed;
        }

        let now = Instant::now();
        let mut window = self.windows.entry(client).or_default();
        window.retain(|stamp| now.duration_since(*stamp) < self.window);

        if window.len() >= self.max_requests {
            // The oldest surviving stamp decides when a slot frees up
            let oldest = window.first().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let remaining = self.window.saturating_sub(elapsed);
            return Admission::Denied {
                retry_after_seconds: remaining.as_secs().max(1),
            };
        }

        window.push(now);
        Admission::Allowed
    }

    /// Number of clients currently tracked
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

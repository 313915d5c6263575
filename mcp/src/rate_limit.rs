//! Per-principal sliding-window rate limiting for tool invocations.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::{core::config::RateLimitConfig, principal::PrincipalId};

/// Length of the trailing admission window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// A sliding window of request timestamps for one principal.
#[derive(Debug, Default)]
struct CallWindow {
    calls: Vec<Instant>,
}

impl CallWindow {
    /// Removes timestamps that fell out of the trailing window.
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(RATE_LIMIT_WINDOW) else {
            return;
        };
        self.calls.retain(|&t| t > cutoff);
    }

    fn record(&mut self, now: Instant) {
        self.calls.push(now);
    }

    fn len(&self) -> usize {
        self.calls.len()
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Admission control keyed by principal.
///
/// Each principal's window is guarded by its map entry, so check-and-record is
/// atomic per principal even under concurrent calls from the same caller.
pub struct RateLimiter {
    windows: DashMap<PrincipalId, CallWindow>,
    enabled: bool,
    capacity: usize,
    max_tracked_principals: usize,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            enabled: config.enabled,
            capacity: config.requests_per_minute as usize,
            max_tracked_principals: config.max_tracked_principals.max(1),
        }
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self::new(&RateLimitConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits or rejects one request for `principal`, recording it on admission.
    pub fn admit(&self, principal: &PrincipalId) -> bool {
        self.admit_at(principal, Instant::now())
    }

    pub(crate) fn admit_at(&self, principal: &PrincipalId, now: Instant) -> bool {
        if !self.enabled {
            return true;
        }

        let admitted = {
            let mut window = self.windows.entry(principal.clone()).or_default();
            window.prune(now);
            if window.len() >= self.capacity {
                false
            } else {
                window.record(now);
                true
            }
        };

        if self.windows.len() > self.max_tracked_principals {
            self.evict_stale(now);
        }

        admitted
    }

    /// Requests currently counted against `principal` in the trailing window.
    pub fn usage(&self, principal: &PrincipalId) -> usize {
        self.windows
            .get_mut(principal)
            .map(|mut window| {
                window.prune(Instant::now());
                window.len()
            })
            .unwrap_or(0)
    }

    /// Number of principals with a tracked window.
    pub fn tracked_principals(&self) -> usize {
        self.windows.len()
    }

    /// Drops principals whose window is empty after pruning.
    ///
    /// Principals with live entries are kept, so admission decisions are
    /// unaffected by the sweep.
    fn evict_stale(&self, now: Instant) {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.prune(now);
            !window.is_empty()
        });
        debug!(
            before = before,
            after = self.windows.len(),
            "Evicted idle rate-limit principals"
        );
    }
}

//! Invocation metrics for one client instance.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of one completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

#[derive(Debug, Default)]
struct RequestStats {
    total: u64,
    successful: u64,
    failed: u64,
    average_response_time_ms: f64,
    last_request_time: Option<DateTime<Utc>>,
}

/// Counters and rolling statistics over tool invocations.
///
/// Request counters are updated under one lock so every snapshot satisfies
/// `total == successful + failed`. Rate-limit hits and authentication failures
/// are bumped by the rate limiter and credential manager respectively.
pub struct McpMetrics {
    requests: Mutex<RequestStats>,
    rate_limit_hits: AtomicU64,
    authentication_failures: AtomicU64,
}

impl McpMetrics {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(RequestStats::default()),
            rate_limit_hits: AtomicU64::new(0),
            authentication_failures: AtomicU64::new(0),
        }
    }

    /// Record one completed request.
    ///
    /// Only successful requests contribute to the average response time.
    pub fn record(&self, outcome: Outcome, duration_ms: f64) {
        let mut stats = self.requests.lock();
        stats.total += 1;
        stats.last_request_time = Some(Utc::now());

        match outcome {
            Outcome::Success => {
                stats.successful += 1;
                let n = stats.successful as f64;
                stats.average_response_time_ms =
                    (stats.average_response_time_ms * (n - 1.0) + duration_ms) / n;
            }
            Outcome::Failure => {
                stats.failed += 1;
            }
        }
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authentication_failure(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stats = self.requests.lock();
        MetricsSnapshot {
            total_requests: stats.total,
            successful_requests: stats.successful,
            failed_requests: stats.failed,
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            average_response_time_ms: stats.average_response_time_ms,
            uptime_percentage: uptime_percentage(stats.successful, stats.total),
            last_request_time: stats.last_request_time,
        }
    }
}

impl Default for McpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn uptime_percentage(successful: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (successful as f64 / total as f64) * 100.0
    }
}

/// Point-in-time copy of the metrics, as reported to the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limit_hits: u64,
    pub authentication_failures: u64,
    pub average_response_time_ms: f64,
    pub uptime_percentage: f64,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        McpMetrics::new().snapshot()
    }
}

//! Per-client rate limiting for registry lookups.
//!
//! - [`RateLimiter`]: the seam the orchestrator talks to.
//! - [`FixedWindowLimiter`]: fixed-window counters keyed by client identifier.
//! - [`Decision`] / [`RateLimitInfo`]: the outcome, including the quota metadata
//!   callers forward as `X-RateLimit-*` headers.
//!
//! Only registry-bound lookups are counted; validation failures and cache hits
//! never reach the limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod fixed_window;
pub use fixed_window::FixedWindowLimiter;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Window length and admissions per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests: u32,
    window: Duration,
}

/// Errors produced when validating a rate-limit policy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitPolicyError {
    #[error("max_requests must be > 0")]
    ZeroMaxRequests,
    #[error("window must be > 0 (got {0:?})")]
    ZeroWindow(Duration),
}

impl RateLimitPolicy {
    /// Validated policy: both values must be non-zero.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, RateLimitPolicyError> {
        if max_requests == 0 {
            return Err(RateLimitPolicyError::ZeroMaxRequests);
        }
        if window.is_zero() {
            return Err(RateLimitPolicyError::ZeroWindow(window));
        }
        Ok(Self { max_requests, window })
    }

    // Callers guarantee both values are non-zero.
    pub(crate) const fn from_parts(max_requests: u32, window: Duration) -> Self {
        Self { max_requests, window }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Quota snapshot for one client, attached to both admissions and rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub client_id: String,
    /// Lookups counted in the current window, including this one when admitted.
    pub current_count: u32,
    pub max_requests: u32,
    pub remaining: u32,
    /// When the current window ends (epoch millis).
    pub reset_time: u64,
    /// Whole seconds until `reset_time`, rounded up.
    pub retry_after_secs: u64,
}

impl RateLimitInfo {
    /// `X-RateLimit-*` headers, plus `Retry-After` when the quota is spent.
    pub fn headers(&self) -> BTreeMap<&'static str, String> {
        let mut headers = BTreeMap::new();
        headers.insert("X-RateLimit-Limit", self.max_requests.to_string());
        headers.insert("X-RateLimit-Remaining", self.remaining.to_string());
        headers.insert("X-RateLimit-Reset", (self.reset_time / 1000).to_string());
        if self.remaining == 0 {
            headers.insert("Retry-After", self.retry_after_secs.to_string());
        }
        headers
    }
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The lookup may proceed.
    Allowed(RateLimitInfo),
    /// Quota exhausted for this window; the registry must not be called.
    Denied(RateLimitInfo),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    pub fn info(&self) -> &RateLimitInfo {
        match self {
            Decision::Allowed(info) | Decision::Denied(info) => info,
        }
    }
}

/// Per-client counters as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub client_id: String,
    pub count: u32,
    pub max_requests: u32,
    pub remaining: u32,
    pub window_start: u64,
    pub window_secs: u64,
    pub reset_time: u64,
}

/// Limiter-wide figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub tracked_clients: usize,
    pub max_requests: u32,
    pub window_secs: u64,
}

/// Core interface for rate limiting logic.
///
/// Implementations must make `check_and_increment` atomic per client: two
/// concurrent calls for the same identifier may never both observe the same count.
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Count one lookup for `client_id` and decide whether it may proceed.
    fn check_and_increment(&self, client_id: &str) -> Decision;
    /// Current bucket for `client_id`, if one is tracked.
    fn stats(&self, client_id: &str) -> Option<BucketStats>;
    /// Limiter-wide figures.
    fn summary(&self) -> LimiterStats;
    /// Replace the policy for windows opened from now on.
    fn set_policy(&self, policy: RateLimitPolicy);
    /// Forget `client_id`. Returns whether it was tracked.
    fn clear(&self, client_id: &str) -> bool;
    /// Forget every client. Returns how many were tracked.
    fn clear_all(&self) -> usize;
    /// Forget clients whose window ended more than `idle` ago. Returns how many.
    fn evict_idle(&self, idle: Duration) -> usize;
}

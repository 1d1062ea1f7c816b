use super::{
    BucketStats, Decision, LimiterStats, RateLimitInfo, RateLimitPolicy, RateLimiter,
};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::dynamic_config::DynamicConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_start: u64,
    window_millis: u64,
    max_requests: u32,
}

impl Bucket {
    // Policy is captured when the window opens; live policy changes apply from the next window.
    fn open(now: u64, policy: &RateLimitPolicy) -> Self {
        Self {
            count: 0,
            window_start: now,
            window_millis: duration_millis(policy.window()),
            max_requests: policy.max_requests(),
        }
    }

    fn expired(&self, now: u64) -> bool {
        now.saturating_sub(self.window_start) >= self.window_millis
    }

    fn reset_time(&self) -> u64 {
        self.window_start.saturating_add(self.window_millis)
    }

    fn info(&self, client_id: &str, now: u64) -> RateLimitInfo {
        let reset_time = self.reset_time();
        RateLimitInfo {
            client_id: client_id.to_owned(),
            current_count: self.count,
            max_requests: self.max_requests,
            remaining: self.max_requests.saturating_sub(self.count),
            reset_time,
            retry_after_secs: reset_time.saturating_sub(now).div_ceil(1000),
        }
    }
}

/// Fixed-window limiter keyed by client identifier (usually the caller's IP).
///
/// Buckets are created on first use and reset exactly when
/// `now - window_start >= window`. Each client's bucket is updated under its
/// map-entry lock, so concurrent lookups from one client are counted without
/// lost updates while different clients proceed in parallel.
///
/// Once per window length, the first call to
/// [`check_and_increment`](RateLimiter::check_and_increment) also drops every
/// bucket whose window has ended, so clients that stop calling are forgotten.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    buckets: DashMap<String, Bucket>,
    policy: DynamicConfig<RateLimitPolicy>,
    clock: Arc<dyn Clock>,
    // Epoch millis at which the next sweep of ended windows is due.
    next_sweep: AtomicU64,
}

impl FixedWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Build a limiter reading time from `clock`.
    pub fn with_clock(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now_millis().saturating_add(duration_millis(policy.window()));
        Self {
            buckets: DashMap::new(),
            policy: DynamicConfig::new(policy),
            clock,
            next_sweep: AtomicU64::new(next_sweep),
        }
    }

    /// Current policy.
    pub fn policy(&self) -> RateLimitPolicy {
        *self.policy.get()
    }

    /// Number of clients with a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    fn drop_ended(&self, now: u64, idle_millis: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            !bucket.expired(now) || now.saturating_sub(bucket.reset_time()) < idle_millis
        });
        before.saturating_sub(self.buckets.len())
    }

    // Must run before any entry guard is taken: `retain` write-locks every shard.
    fn sweep_if_due(&self, now: u64, policy: &RateLimitPolicy) {
        let due = self.next_sweep.load(Ordering::Acquire);
        if now < due {
            return;
        }
        let next = now.saturating_add(duration_millis(policy.window()));
        if self.next_sweep.compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return;
        }
        let dropped = self.drop_ended(now, 0);
        if dropped > 0 {
            tracing::debug!(dropped, remaining = self.buckets.len(), "rate-limit buckets swept");
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check_and_increment(&self, client_id: &str) -> Decision {
        let now = self.clock.now_millis();
        let policy = self.policy.get();
        self.sweep_if_due(now, &policy);

        // The entry guard holds this client's shard lock until the decision is made.
        let mut bucket =
            self.buckets.entry(client_id.to_owned()).or_insert_with(|| Bucket::open(now, &policy));
        if bucket.expired(now) {
            *bucket = Bucket::open(now, &policy);
        }

        if bucket.count < bucket.max_requests {
            bucket.count += 1;
            Decision::Allowed(bucket.info(client_id, now))
        } else {
            let info = bucket.info(client_id, now);
            drop(bucket);
            tracing::warn!(
                client_id,
                count = info.current_count,
                max = info.max_requests,
                retry_after_secs = info.retry_after_secs,
                "vehicle lookup rate limit exceeded"
            );
            Decision::Denied(info)
        }
    }

    fn stats(&self, client_id: &str) -> Option<BucketStats> {
        let now = self.clock.now_millis();
        let bucket = *self.buckets.get(client_id)?.value();
        // An expired bucket reads as a fresh window.
        let count = if bucket.expired(now) { 0 } else { bucket.count };
        Some(BucketStats {
            client_id: client_id.to_owned(),
            count,
            max_requests: bucket.max_requests,
            remaining: bucket.max_requests.saturating_sub(count),
            window_start: bucket.window_start,
            window_secs: bucket.window_millis / 1000,
            reset_time: bucket.reset_time(),
        })
    }

    fn summary(&self) -> LimiterStats {
        let policy = self.policy();
        LimiterStats {
            tracked_clients: self.buckets.len(),
            max_requests: policy.max_requests(),
            window_secs: policy.window().as_secs(),
        }
    }

    // Running windows keep the limits they opened with.
    fn set_policy(&self, policy: RateLimitPolicy) {
        self.policy.set(policy);
        tracing::info!(
            max_requests = policy.max_requests(),
            window_secs = policy.window().as_secs(),
            "vehicle lookup rate-limit policy updated"
        );
    }

    fn clear(&self, client_id: &str) -> bool {
        self.buckets.remove(client_id).is_some()
    }

    fn clear_all(&self) -> usize {
        let removed = self.buckets.len();
        self.buckets.clear();
        removed
    }

    fn evict_idle(&self, idle: Duration) -> usize {
        let dropped = self.drop_ended(self.clock.now_millis(), duration_millis(idle));
        tracing::info!(dropped, idle_secs = idle.as_secs(), "idle rate-limit buckets evicted");
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u32, window: Duration) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::starting_at(1_700_000_000_000);
        let policy = RateLimitPolicy::new(max, window).unwrap();
        (FixedWindowLimiter::with_clock(policy, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn admits_exactly_max_then_denies() {
        let (limiter, _clock) = limiter(3, Duration::from_secs(60));
        for expected_remaining in [2, 1, 0] {
            match limiter.check_and_increment("1.2.3.4") {
                Decision::Allowed(info) => assert_eq!(info.remaining, expected_remaining),
                Decision::Denied(_) => panic!("should be admitted"),
            }
        }
        let denied = limiter.check_and_increment("1.2.3.4");
        assert!(!denied.is_allowed());
        assert_eq!(denied.info().current_count, 3);
        assert_eq!(denied.info().max_requests, 3);
        assert_eq!(denied.info().retry_after_secs, 60);
    }

    #[test]
    fn window_rollover_restarts_count() {
        let (limiter, clock) = limiter(2, Duration::from_secs(60));
        assert!(limiter.check_and_increment("a").is_allowed());
        assert!(limiter.check_and_increment("a").is_allowed());
        assert!(!limiter.check_and_increment("a").is_allowed());

        clock.advance(Duration::from_millis(59_999));
        assert!(!limiter.check_and_increment("a").is_allowed());

        clock.advance(Duration::from_millis(1));
        let decision = limiter.check_and_increment("a");
        assert!(decision.is_allowed());
        assert_eq!(decision.info().current_count, 1);
    }

    #[test]
    fn clients_are_independent() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(60));
        assert!(limiter.check_and_increment("a").is_allowed());
        assert!(!limiter.check_and_increment("a").is_allowed());
        assert!(limiter.check_and_increment("b").is_allowed());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn stats_and_clear() {
        let (limiter, clock) = limiter(5, Duration::from_secs(60));
        assert!(limiter.stats("a").is_none());
        limiter.check_and_increment("a");
        limiter.check_and_increment("a");
        let stats = limiter.stats("a").unwrap();
        assert_eq!((stats.count, stats.remaining, stats.window_secs), (2, 3, 60));

        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.stats("a").unwrap().count, 0);

        assert!(limiter.clear("a"));
        assert!(!limiter.clear("a"));
        limiter.check_and_increment("b");
        limiter.check_and_increment("c");
        assert_eq!(limiter.clear_all(), 2);
        assert_eq!(limiter.summary().tracked_clients, 0);
    }

    #[test]
    fn policy_change_applies_from_next_window() {
        let (limiter, clock) = limiter(1, Duration::from_secs(10));
        assert!(limiter.check_and_increment("a").is_allowed());
        limiter.set_policy(RateLimitPolicy::new(3, Duration::from_secs(10)).unwrap());
        assert!(!limiter.check_and_increment("a").is_allowed());

        clock.advance(Duration::from_secs(10));
        for _ in 0..3 {
            assert!(limiter.check_and_increment("a").is_allowed());
        }
        assert_eq!(limiter.summary().max_requests, 3);
    }

    #[test]
    fn evicts_idle_buckets() {
        let (limiter, clock) = limiter(1, Duration::from_secs(10));
        limiter.check_and_increment("old");
        clock.advance(Duration::from_secs(5));
        limiter.check_and_increment("recent");

        // "old" ended 40s ago, "recent" 35s ago.
        clock.advance(Duration::from_secs(45));
        assert_eq!(limiter.evict_idle(Duration::from_secs(38)), 1);
        assert!(limiter.stats("old").is_none());
        assert!(limiter.stats("recent").is_some());
        assert_eq!(limiter.evict_idle(Duration::ZERO), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn evict_idle_keeps_running_windows() {
        let (limiter, clock) = limiter(5, Duration::from_secs(60));
        limiter.check_and_increment("a");
        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.evict_idle(Duration::ZERO), 0);
        assert_eq!(limiter.stats("a").unwrap().count, 1);
    }

    #[test]
    fn ended_windows_are_swept_once_per_window() {
        let (limiter, clock) = limiter(1, Duration::from_secs(60));
        for n in 0..100 {
            limiter.check_and_increment(&format!("10.0.0.{n}"));
        }
        assert_eq!(limiter.tracked_clients(), 100);

        // Within the first window nothing has ended yet.
        clock.advance(Duration::from_secs(59));
        limiter.check_and_increment("10.0.1.1");
        assert_eq!(limiter.tracked_clients(), 101);

        clock.advance(Duration::from_secs(24 * 60 * 60));
        let decision = limiter.check_and_increment("10.0.1.2");
        assert!(decision.is_allowed());
        assert_eq!(limiter.tracked_clients(), 1);
    }
}

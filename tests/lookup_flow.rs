mod common;

use common::{config, service, Behaviour, StubRegistry};
use std::time::Duration;
use vehicle_lookup::{
    CircuitBreakerConfig, CircuitState, FallbackReason, LookupError, LookupOutcome, Origin,
    RegistryError,
};

const CLIENT: &str = "203.0.113.10";

#[tokio::test]
async fn first_lookup_hits_registry_then_cache_serves() {
    let registry = StubRegistry::succeeding();
    let (lookup, clock) = service(registry.clone(), config(30));

    let first = lookup.lookup("abc-1234", CLIENT).await;
    let LookupOutcome::Success(record) = first else { panic!("expected success") };
    assert_eq!(record.origin(), Origin::Api);
    assert_eq!(record.plate(), "ABC1234");
    assert_eq!(record.details().make.as_deref(), Some("FIAT"));
    assert!(record.metadata().latency_ms.is_some());
    let quota = record.rate_limit().expect("registry lookups carry quota metadata");
    assert_eq!((quota.current_count, quota.remaining), (1, 29));
    assert_eq!(quota.headers()["X-RateLimit-Remaining"], "29");
    assert_eq!(lookup.cache().len(), 1);

    clock.advance(Duration::from_secs(5));
    let second = lookup.lookup("ABC 1234", CLIENT).await;
    let LookupOutcome::Success(cached) = second else { panic!("expected success") };
    assert_eq!(cached.origin(), Origin::Cache);
    assert_eq!(cached.details(), record.details());
    assert_eq!(cached.metadata().cache_age_ms, Some(5_000));
    assert!(cached.rate_limit().is_none());
    assert_eq!(registry.calls(), 1);
}

#[tokio::test]
async fn cache_hits_spend_no_quota() {
    let registry = StubRegistry::succeeding();
    let (lookup, _clock) = service(registry.clone(), config(1));

    assert!(matches!(lookup.lookup("ABC1234", CLIENT).await, LookupOutcome::Success(_)));
    for _ in 0..5 {
        let outcome = lookup.lookup("ABC1234", CLIENT).await;
        assert_eq!(outcome.record().map(|r| r.origin()), Some(Origin::Cache));
    }
    assert_eq!(registry.calls(), 1);
    assert_eq!(lookup.rate_limit_stats(CLIENT).unwrap().count, 1);
}

#[tokio::test]
async fn forced_open_breaker_degrades_without_calling_registry() {
    let registry = StubRegistry::succeeding();
    let (lookup, _clock) = service(registry.clone(), config(30));
    lookup.force_open();

    let outcome = lookup.lookup("BRA2E19", CLIENT).await;
    let LookupOutcome::ManualFallback(record) = outcome else { panic!("expected fallback") };
    assert_eq!(record.origin(), Origin::Manual);
    assert_eq!(record.plate(), "BRA2E19");
    assert_eq!(record.fallback_reason(), Some(&FallbackReason::CircuitOpen { retry_in_ms: None }));
    assert_eq!(registry.calls(), 0);
    assert!(lookup.rate_limit_stats(CLIENT).is_none());

    lookup.force_close();
    assert_eq!(lookup.lookup("BRA2E19", CLIENT).await.record().unwrap().origin(), Origin::Api);
}

#[tokio::test]
async fn quota_exhaustion_reports_counts() {
    let registry = StubRegistry::succeeding();
    let (lookup, clock) = service(registry.clone(), config(2));

    assert!(lookup.lookup("AAA1111", CLIENT).await.record().is_some());
    assert!(lookup.lookup("AAA2222", CLIENT).await.record().is_some());

    let err = lookup.lookup_plate("AAA3333", CLIENT).await.unwrap_err();
    let LookupError::RateLimitExceeded(info) = err else { panic!("expected rate limit") };
    assert_eq!(info.current_count, info.max_requests);
    assert_eq!(info.max_requests, 2);
    assert_eq!(info.remaining, 0);
    assert_eq!(info.reset_time, common::START_MILLIS + 60_000);
    assert_eq!(registry.calls(), 2);

    // Other clients keep their own quota.
    assert!(lookup.lookup("AAA3333", "198.51.100.1").await.record().is_some());

    clock.advance(Duration::from_secs(60));
    assert!(lookup.lookup("AAA4444", CLIENT).await.record().is_some());
}

#[tokio::test]
async fn malformed_plates_change_nothing() {
    let registry = StubRegistry::succeeding();
    let (lookup, _clock) = service(registry.clone(), config(1));

    for bad in ["ABC12345", "1234ABC", "AB-C12.3", "ÁBC1234"] {
        let err = lookup.lookup_plate(bad, CLIENT).await.unwrap_err();
        assert!(err.is_invalid_plate(), "{bad} should be rejected");
    }
    assert_eq!(registry.calls(), 0);
    assert!(lookup.rate_limit_stats(CLIENT).is_none());
    let stats = lookup.stats();
    assert_eq!((stats.cache.hits, stats.cache.misses), (0, 0));
    assert_eq!(stats.breaker.consecutive_failures, 0);
}

#[tokio::test]
async fn failures_open_breaker_and_trial_recovers_it() {
    let registry = StubRegistry::failing();
    let (lookup, clock) = service(registry.clone(), config(100));

    for n in 0..5 {
        let plate = format!("FAL000{n}");
        let outcome = lookup.lookup(&plate, CLIENT).await;
        let record = outcome.record().unwrap();
        assert_eq!(record.origin(), Origin::Manual);
        assert_eq!(record.fallback_reason(), Some(&FallbackReason::RegistryHttp { status: 503 }));
    }
    assert_eq!(lookup.breaker().state(), CircuitState::Open);
    assert_eq!(registry.calls(), 5);

    let outcome = lookup.lookup("FAL0009", CLIENT).await;
    assert_eq!(
        outcome.record().unwrap().fallback_reason(),
        Some(&FallbackReason::CircuitOpen { retry_in_ms: Some(30_000) })
    );
    assert_eq!(registry.calls(), 5, "open breaker must not reach the registry");

    clock.advance(Duration::from_secs(30));
    registry.set(Behaviour::Succeed);
    let outcome = lookup.lookup("FAL0009", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Api);
    assert_eq!(lookup.breaker().state(), CircuitState::Closed);
    assert_eq!(lookup.breaker_status().consecutive_failures, 0);
}

#[tokio::test]
async fn failed_trial_reopens_breaker() {
    let registry = StubRegistry::failing();
    let mut cfg = config(100);
    cfg.breaker = vehicle_lookup::CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let (lookup, clock) = service(registry.clone(), cfg);

    lookup.lookup("ABC1234", CLIENT).await;
    clock.advance(Duration::from_secs(10));
    registry.set(Behaviour::Fail(RegistryError::Timeout {
        elapsed: Duration::from_secs(8),
        timeout: Duration::from_secs(8),
    }));

    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(
        outcome.record().unwrap().fallback_reason(),
        Some(&FallbackReason::RegistryTimeout { timeout_ms: 8_000 })
    );
    assert_eq!(lookup.breaker().state(), CircuitState::Open);
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn cancelled_trial_records_nothing() {
    let registry = StubRegistry::failing();
    let mut cfg = config(100);
    cfg.breaker = vehicle_lookup::CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let (lookup, clock) = service(registry.clone(), cfg);

    lookup.lookup("ABC1234", CLIENT).await;
    clock.advance(Duration::from_secs(10));
    registry.set(Behaviour::Hang);

    let cancelled =
        tokio::time::timeout(Duration::from_millis(20), lookup.lookup("ABC1234", CLIENT)).await;
    assert!(cancelled.is_err());
    let status = lookup.breaker_status();
    assert_eq!(status.state, CircuitState::HalfOpen);
    assert_eq!(status.total_failures, 1);

    // The trial slot was handed back.
    registry.set(Behaviour::Succeed);
    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Api);
    assert_eq!(lookup.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn blank_plate_yields_manual_record() {
    let registry = StubRegistry::succeeding();
    let (lookup, _clock) = service(registry.clone(), config(1));

    let record = lookup.lookup_plate("", CLIENT).await.unwrap();
    assert_eq!(record.origin(), Origin::Manual);
    assert_eq!(record.plate(), "");
    assert_eq!(record.fallback_reason(), Some(&FallbackReason::MissingPlate));
    assert_eq!(registry.calls(), 0);
}

#[tokio::test]
async fn expired_cache_entry_goes_back_to_registry() {
    let registry = StubRegistry::succeeding();
    let mut cfg = config(10);
    cfg.cache.ttl = Duration::from_secs(60);
    let (lookup, clock) = service(registry.clone(), cfg);

    lookup.lookup("ABC1234", CLIENT).await;
    clock.advance(Duration::from_secs(61));
    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Api);
    assert_eq!(registry.calls(), 2);
}

#[tokio::test]
async fn cached_plates_are_served_while_a_trial_is_in_flight() {
    let registry = StubRegistry::succeeding();
    let mut cfg = config(100);
    cfg.breaker = CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let (lookup, clock) = service(registry.clone(), cfg);

    lookup.lookup("ABC1234", CLIENT).await;
    registry.set(Behaviour::Fail(RegistryError::Http { status: 503 }));
    lookup.lookup("XYZ9876", CLIENT).await;
    assert_eq!(lookup.breaker().state(), CircuitState::Open);

    // Still cooling down: even cached plates degrade.
    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Manual);

    clock.advance(Duration::from_secs(10));
    // A cache hit after the cool-down neither claims the trial nor moves the state.
    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Cache);
    assert_eq!(lookup.breaker().state(), CircuitState::Open);

    registry.set(Behaviour::Slow(Duration::from_millis(300)));
    let trial = tokio::spawn({
        let lookup = lookup.clone();
        async move { lookup.lookup("XYZ9876", CLIENT).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lookup.breaker().state(), CircuitState::HalfOpen);

    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Cache);

    // A miss cannot reach the registry while the trial runs.
    let outcome = lookup.lookup("DEF5678", CLIENT).await;
    assert_eq!(
        outcome.record().unwrap().fallback_reason(),
        Some(&FallbackReason::CircuitOpen { retry_in_ms: None })
    );

    let trial = trial.await.unwrap();
    assert_eq!(trial.record().unwrap().origin(), Origin::Api);
    assert_eq!(lookup.breaker().state(), CircuitState::Closed);
    assert_eq!(registry.calls(), 3);
}

#[tokio::test]
async fn clients_that_stop_calling_are_forgotten() {
    let registry = StubRegistry::succeeding();
    let (lookup, clock) = service(registry.clone(), config(5));

    for n in 0..500 {
        let client = format!("10.0.{}.{}", n / 256, n % 256);
        lookup.lookup(&format!("IPS{n:04}"), &client).await;
    }
    assert_eq!(lookup.stats().rate_limit.tracked_clients, 500);

    clock.advance(Duration::from_secs(24 * 60 * 60));
    let outcome = lookup.lookup("NEW0001", "10.9.9.9").await;
    assert_eq!(outcome.record().unwrap().origin(), Origin::Api);
    assert_eq!(lookup.stats().rate_limit.tracked_clients, 1);
}

#[tokio::test]
async fn panicking_registry_counts_as_a_failure() {
    let registry = StubRegistry::new(Behaviour::Panic);
    let mut cfg = config(100);
    cfg.breaker = CircuitBreakerConfig::new(1, Duration::from_secs(10)).unwrap();
    let (lookup, clock) = service(registry.clone(), cfg);

    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert_eq!(
        outcome.record().unwrap().fallback_reason(),
        Some(&FallbackReason::Internal { message: "registry exploded".into() })
    );
    assert_eq!(lookup.breaker().state(), CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    let outcome = lookup.lookup("ABC1234", CLIENT).await;
    assert!(outcome.is_fallback());
    assert_eq!(lookup.breaker().state(), CircuitState::Open, "a panicking trial reopens");
    assert_eq!(lookup.breaker_status().total_failures, 2);
    assert_eq!(registry.calls(), 2);

    let err = lookup.refresh("ABC1234").await.unwrap_err();
    assert!(err.is_registry_unavailable());
}

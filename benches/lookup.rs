use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use vehicle_lookup::{
    CircuitBreaker, CircuitBreakerConfig, FixedWindowLimiter, LookupConfig, Plate,
    RateLimitPolicy, RateLimiter, RegistryError, VehicleDetails, VehicleLookup, VehicleRegistry,
};

// Answers immediately so the benches measure the resilience layers only.
#[derive(Debug)]
struct InstantRegistry;

#[async_trait]
impl VehicleRegistry for InstantRegistry {
    async fn fetch(&self, _plate: &Plate) -> Result<VehicleDetails, RegistryError> {
        Ok(VehicleDetails { make: Some("FIAT".into()), ..VehicleDetails::default() })
    }
}

fn lookup_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let lookup = VehicleLookup::builder(Arc::new(InstantRegistry))
        .config(LookupConfig::default())
        .build();
    rt.block_on(lookup.lookup("ABC1234", "bench"));

    c.bench_function("lookup_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(lookup.lookup(black_box("abc-1234"), "bench").await);
        });
    });
}

fn limiter_check(c: &mut Criterion) {
    let limiter =
        FixedWindowLimiter::new(RateLimitPolicy::new(u32::MAX, Duration::from_secs(900)).unwrap());
    let clients: Vec<String> = (0..256).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let mut i = 0usize;

    c.bench_function("fixed_window_check_and_increment", |b| {
        b.iter(|| {
            i = (i + 1) % clients.len();
            black_box(limiter.check_and_increment(&clients[i]));
        });
    });
}

fn breaker_permit(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

    c.bench_function("circuit_breaker_acquire_success", |b| {
        b.iter(|| {
            if let Ok(permit) = breaker.try_acquire() {
                permit.record_success();
            }
        });
    });
}

criterion_group!(benches, lookup_cache_hit, limiter_check, breaker_permit);
criterion_main!(benches);

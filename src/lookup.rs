//! Plate lookup orchestration.
//!
//! [`VehicleLookup`] owns the cache, the rate limiter, the circuit breaker and
//! the registry client, and runs every lookup through them in a fixed order:
//!
//! 1. validate the plate (pure, no shared state touched)
//! 2. degrade to a manual record while the breaker is held open
//! 3. serve from cache when fresh (no quota spent, no permit taken)
//! 4. take a breaker permit; in half-open only one miss gets the trial
//! 5. count the lookup against the client's quota
//! 6. call the registry, report the outcome to the breaker, populate the cache
//!
//! Registry trouble never surfaces as an error from [`VehicleLookup::lookup`]:
//! it produces a degraded record whose metadata says why.

use crate::cache::VehicleCache;
use crate::circuit_breaker::{CallError, CircuitBreaker, Rejected};
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::LookupConfig;
use crate::error::LookupError;
use crate::plate::{Plate, PlateError};
use crate::rate_limit::{Decision, FixedWindowLimiter, RateLimitInfo, RateLimiter};
use crate::registry::{HttpRegistryClient, RegistryError, VehicleRegistry};
use crate::vehicle::{FallbackReason, VehicleDetails, VehicleRecord};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// What a lookup produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Registry or cache data; origin is `api` or `cache`.
    Success(VehicleRecord),
    /// No registry data; origin is `manual` or `api_com_fallback`.
    ManualFallback(VehicleRecord),
    /// The client's quota is spent. Nothing was fetched.
    RateLimited(RateLimitInfo),
    /// The plate is malformed. Nothing was touched.
    InvalidInput(PlateError),
}

impl LookupOutcome {
    /// The record, for the outcomes that carry one.
    pub fn record(&self) -> Option<&VehicleRecord> {
        match self {
            LookupOutcome::Success(record) | LookupOutcome::ManualFallback(record) => Some(record),
            LookupOutcome::RateLimited(_) | LookupOutcome::InvalidInput(_) => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, LookupOutcome::ManualFallback(_))
    }

    /// Collapse into the record-or-error shape. Fallback records are `Ok`.
    pub fn into_result(self) -> Result<VehicleRecord, LookupError> {
        match self {
            LookupOutcome::Success(record) | LookupOutcome::ManualFallback(record) => Ok(record),
            LookupOutcome::RateLimited(info) => Err(LookupError::RateLimitExceeded(info)),
            LookupOutcome::InvalidInput(err) => Err(LookupError::InvalidPlateFormat(err)),
        }
    }
}

/// Resilient plate lookup service. Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct VehicleLookup {
    pub(crate) cache: Arc<VehicleCache>,
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) registry: Arc<dyn VehicleRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl VehicleLookup {
    pub fn builder(registry: Arc<dyn VehicleRegistry>) -> VehicleLookupBuilder {
        VehicleLookupBuilder {
            registry,
            config: LookupConfig::default(),
            clock: None,
            limiter: None,
        }
    }

    /// Wire a service that talks to the HTTP registry described by `config`.
    pub fn from_config(config: LookupConfig) -> Result<Self, RegistryError> {
        let registry = HttpRegistryClient::new(config.registry.clone())?;
        Ok(Self::builder(Arc::new(registry)).config(config).build())
    }

    /// Resolve `raw_plate` for `client_id`.
    pub async fn lookup(&self, raw_plate: &str, client_id: &str) -> LookupOutcome {
        self.lookup_with_hint(raw_plate, client_id, None).await
    }

    /// Like [`lookup`](Self::lookup), with attributes the caller already has.
    /// They are used only if the registry cannot be consulted, in which case the
    /// record's origin is `api_com_fallback`.
    pub async fn lookup_with_hint(
        &self,
        raw_plate: &str,
        client_id: &str,
        hint: Option<VehicleDetails>,
    ) -> LookupOutcome {
        if raw_plate.trim().is_empty() {
            tracing::debug!(client_id, "lookup without plate, vehicle data left to the caller");
            return LookupOutcome::ManualFallback(VehicleRecord::fallback(
                None,
                hint,
                FallbackReason::MissingPlate,
                self.now(),
            ));
        }

        let plate = match Plate::parse(raw_plate) {
            Ok(plate) => plate,
            Err(err) => {
                tracing::debug!(client_id, error = %err, "rejected malformed plate");
                return LookupOutcome::InvalidInput(err);
            }
        };

        if let Err(rejected) = self.breaker.check_open() {
            return self.short_circuited(&plate, hint, rejected);
        }

        if let Some(entry) = self.cache.get(&plate) {
            let now = self.now();
            let age = entry.age_millis(now);
            tracing::debug!(plate = %plate, age_ms = age, "vehicle served from cache");
            return LookupOutcome::Success(entry.record.served_from_cache(age, now));
        }

        // Claimed only on a miss, so cache hits never hold the half-open trial slot.
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => return self.short_circuited(&plate, hint, rejected),
        };

        let quota = match self.limiter.check_and_increment(client_id) {
            Decision::Allowed(info) => info,
            Decision::Denied(info) => {
                drop(permit);
                return LookupOutcome::RateLimited(info);
            }
        };

        let started = Instant::now();
        match self.fetch(&plate).await {
            Ok(details) => {
                permit.record_success();
                let latency = started.elapsed();
                let record = VehicleRecord::from_registry(&plate, details, latency, self.now());
                tracing::debug!(
                    plate = %plate,
                    latency_ms = duration_millis(latency),
                    "vehicle fetched from registry"
                );
                self.cache.put(plate, record.clone());
                LookupOutcome::Success(record.with_rate_limit(quota))
            }
            Err(reason) => {
                let tripped = permit.record_failure();
                tracing::warn!(
                    plate = %plate,
                    error = %reason,
                    tripped,
                    "vehicle registry lookup failed, falling back to manual entry"
                );
                let record = VehicleRecord::fallback(Some(&plate), hint, reason, self.now());
                LookupOutcome::ManualFallback(record.with_rate_limit(quota))
            }
        }
    }

    fn short_circuited(
        &self,
        plate: &Plate,
        hint: Option<VehicleDetails>,
        rejected: Rejected,
    ) -> LookupOutcome {
        tracing::debug!(plate = %plate, reason = %rejected, "registry skipped, circuit open");
        let reason =
            FallbackReason::CircuitOpen { retry_in_ms: rejected.retry_in.map(duration_millis) };
        let record = VehicleRecord::fallback(Some(plate), hint, reason, self.now());
        LookupOutcome::ManualFallback(record)
    }

    // A panicking registry client counts as a failed attempt like any other error.
    async fn fetch(&self, plate: &Plate) -> Result<VehicleDetails, FallbackReason> {
        match AssertUnwindSafe(self.registry.fetch(plate)).catch_unwind().await {
            Ok(result) => result.map_err(|err| FallbackReason::from(&err)),
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(
                    plate = %plate,
                    error = %message,
                    "vehicle lookup panicked in the registry client"
                );
                Err(FallbackReason::Internal { message })
            }
        }
    }

    /// Record-or-error form of [`lookup`](Self::lookup).
    pub async fn lookup_plate(
        &self,
        raw_plate: &str,
        client_id: &str,
    ) -> Result<VehicleRecord, LookupError> {
        self.lookup(raw_plate, client_id).await.into_result()
    }

    /// Re-fetch `raw_plate` for an operator, bypassing the cache and the rate
    /// limiter. The breaker still applies. A fresh result replaces the cached one.
    pub async fn refresh(&self, raw_plate: &str) -> Result<VehicleRecord, LookupError> {
        let plate = Plate::parse(raw_plate)?;
        let started = Instant::now();

        match self.breaker.call(|| self.fetch(&plate)).await {
            Ok(details) => {
                let record =
                    VehicleRecord::from_registry(&plate, details, started.elapsed(), self.now());
                self.cache.put(plate.clone(), record.clone());
                tracing::info!(plate = %plate, "vehicle record refreshed");
                Ok(record)
            }
            Err(CallError::Rejected(rejected)) => Err(LookupError::RegistryUnavailable {
                reason: FallbackReason::CircuitOpen {
                    retry_in_ms: rejected.retry_in.map(duration_millis),
                },
            }),
            Err(CallError::Inner(reason)) => {
                tracing::warn!(plate = %plate, error = %reason, "vehicle refresh failed");
                Err(LookupError::RegistryUnavailable { reason })
            }
        }
    }

    pub fn cache(&self) -> &VehicleCache {
        &self.cache
    }

    pub fn limiter(&self) -> &dyn RateLimiter {
        self.limiter.as_ref()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "lookup panicked".to_owned()
    }
}

/// Builder for [`VehicleLookup`].
#[derive(Debug)]
pub struct VehicleLookupBuilder {
    registry: Arc<dyn VehicleRegistry>,
    config: LookupConfig,
    clock: Option<Arc<dyn Clock>>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl VehicleLookupBuilder {
    pub fn config(mut self, config: LookupConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source shared by the cache, the default limiter and the breaker.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the default [`FixedWindowLimiter`].
    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> VehicleLookup {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(FixedWindowLimiter::with_clock(self.config.rate_limit, clock.clone()))
        });
        VehicleLookup {
            cache: Arc::new(VehicleCache::with_clock(self.config.cache, clock.clone())),
            limiter,
            breaker: CircuitBreaker::with_clock(self.config.breaker, clock.clone()),
            registry: self.registry,
            clock,
        }
    }
}

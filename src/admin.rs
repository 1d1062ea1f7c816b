//! Operator surface: inspection and manual overrides.
//!
//! The plain methods on [`VehicleLookup`] are what an embedding service wires
//! to its own admin routes. [`AdminCommand`] / [`AdminHandler`] offer the same
//! operations as serialisable commands for a control transport. Authorization
//! is the caller's responsibility.

use crate::cache::CacheStats;
use crate::circuit_breaker::BreakerStatus;
use crate::lookup::VehicleLookup;
use crate::plate::{Plate, PlateError};
use crate::rate_limit::{BucketStats, LimiterStats, RateLimitPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Combined snapshot of every resilience component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    pub cache: CacheStats,
    pub rate_limit: LimiterStats,
    pub breaker: BreakerStatus,
}

impl VehicleLookup {
    pub fn stats(&self) -> LookupStats {
        LookupStats {
            cache: self.cache.stats(),
            rate_limit: self.limiter.summary(),
            breaker: self.breaker.status(),
        }
    }

    /// Empty the cache. Returns how many entries were dropped.
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    /// Drop the cached record for `raw_plate`, which is normalised first.
    pub fn invalidate_plate(&self, raw_plate: &str) -> Result<bool, PlateError> {
        let plate = Plate::parse(raw_plate)?;
        Ok(self.cache.invalidate(&plate))
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        self.cache.set_ttl(ttl);
    }

    pub fn clear_rate_limit(&self, client_id: &str) -> bool {
        self.limiter.clear(client_id)
    }

    pub fn clear_all_rate_limits(&self) -> usize {
        self.limiter.clear_all()
    }

    /// Forget clients whose window ended more than `idle` ago.
    pub fn evict_idle_rate_limits(&self, idle: Duration) -> usize {
        self.limiter.evict_idle(idle)
    }

    pub fn rate_limit_stats(&self, client_id: &str) -> Option<BucketStats> {
        self.limiter.stats(client_id)
    }

    pub fn set_rate_limit(&self, policy: RateLimitPolicy) {
        self.limiter.set_policy(policy);
    }

    pub fn force_open(&self) {
        self.breaker.force_open();
    }

    pub fn force_close(&self) {
        self.breaker.force_close();
    }

    pub fn reset_breaker_metrics(&self) {
        self.breaker.reset_metrics();
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }
}

/// Serialisable admin commands, tagged by `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    Stats,
    ClearCache,
    InvalidatePlate { plate: String },
    PurgeExpired,
    SetCacheTtl { ttl_secs: u64 },
    ClearRateLimit { client_id: String },
    ClearAllRateLimits,
    EvictIdleRateLimits { idle_secs: u64 },
    RateLimitStats { client_id: String },
    SetRateLimit { max_requests: u32, window_secs: u64 },
    ForceOpen,
    ForceClose,
    ResetBreakerMetrics,
    BreakerStatus,
    /// Re-fetch a plate from the registry, bypassing cache and quota.
    Refresh { plate: String },
}

impl AdminCommand {
    pub fn label(&self) -> &'static str {
        match self {
            AdminCommand::Stats => "stats",
            AdminCommand::ClearCache => "clear_cache",
            AdminCommand::InvalidatePlate { .. } => "invalidate_plate",
            AdminCommand::PurgeExpired => "purge_expired",
            AdminCommand::SetCacheTtl { .. } => "set_cache_ttl",
            AdminCommand::ClearRateLimit { .. } => "clear_rate_limit",
            AdminCommand::ClearAllRateLimits => "clear_all_rate_limits",
            AdminCommand::EvictIdleRateLimits { .. } => "evict_idle_rate_limits",
            AdminCommand::RateLimitStats { .. } => "rate_limit_stats",
            AdminCommand::SetRateLimit { .. } => "set_rate_limit",
            AdminCommand::ForceOpen => "force_open",
            AdminCommand::ForceClose => "force_close",
            AdminCommand::ResetBreakerMetrics => "reset_breaker_metrics",
            AdminCommand::BreakerStatus => "breaker_status",
            AdminCommand::Refresh { .. } => "refresh",
        }
    }
}

/// Structured command failure payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminFailure {
    InvalidArgs { msg: String },
    NotFound { what: String },
    /// The registry could not serve a refresh.
    Unavailable { msg: String },
    Internal { msg: String },
}

impl fmt::Display for AdminFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminFailure::InvalidArgs { msg } => write!(f, "{msg}"),
            AdminFailure::NotFound { what } => write!(f, "{what} not found"),
            AdminFailure::Unavailable { msg } => write!(f, "unavailable: {msg}"),
            AdminFailure::Internal { msg } => write!(f, "{msg}"),
        }
    }
}

/// Admin command result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum AdminResult {
    Ack,
    /// Number of entries affected.
    Count(usize),
    Value(serde_json::Value),
    Error(AdminFailure),
}

impl AdminResult {
    pub fn is_error(&self) -> bool {
        matches!(self, AdminResult::Error(_))
    }
}

/// Dispatches [`AdminCommand`]s onto a [`VehicleLookup`].
#[derive(Debug, Clone)]
pub struct AdminHandler {
    lookup: VehicleLookup,
}

impl AdminHandler {
    pub fn new(lookup: VehicleLookup) -> Self {
        Self { lookup }
    }

    pub async fn handle(&self, cmd: AdminCommand) -> AdminResult {
        let label = cmd.label();
        let result = self.execute(cmd).await;
        match &result {
            AdminResult::Error(failure) => {
                tracing::warn!(command = label, error = %failure, "admin command failed")
            }
            _ => tracing::info!(command = label, "admin command executed"),
        }
        result
    }

    async fn execute(&self, cmd: AdminCommand) -> AdminResult {
        let lookup = &self.lookup;
        match cmd {
            AdminCommand::Stats => to_value(&lookup.stats()),
            AdminCommand::ClearCache => AdminResult::Count(lookup.clear_cache()),
            AdminCommand::InvalidatePlate { plate } => match lookup.invalidate_plate(&plate) {
                Ok(true) => AdminResult::Ack,
                Ok(false) => AdminResult::Error(AdminFailure::NotFound { what: plate }),
                Err(e) => invalid(e),
            },
            AdminCommand::PurgeExpired => AdminResult::Count(lookup.purge_expired()),
            AdminCommand::SetCacheTtl { ttl_secs: 0 } => invalid("ttl_secs must be > 0"),
            AdminCommand::SetCacheTtl { ttl_secs } => {
                lookup.set_cache_ttl(Duration::from_secs(ttl_secs));
                AdminResult::Ack
            }
            AdminCommand::ClearRateLimit { client_id } => {
                if lookup.clear_rate_limit(&client_id) {
                    AdminResult::Ack
                } else {
                    AdminResult::Error(AdminFailure::NotFound { what: client_id })
                }
            }
            AdminCommand::ClearAllRateLimits => AdminResult::Count(lookup.clear_all_rate_limits()),
            AdminCommand::EvictIdleRateLimits { idle_secs } => {
                AdminResult::Count(lookup.evict_idle_rate_limits(Duration::from_secs(idle_secs)))
            }
            AdminCommand::RateLimitStats { client_id } => match lookup.rate_limit_stats(&client_id) {
                Some(stats) => to_value(&stats),
                None => AdminResult::Error(AdminFailure::NotFound { what: client_id }),
            },
            AdminCommand::SetRateLimit { max_requests, window_secs } => {
                match RateLimitPolicy::new(max_requests, Duration::from_secs(window_secs)) {
                    Ok(policy) => {
                        lookup.set_rate_limit(policy);
                        AdminResult::Ack
                    }
                    Err(e) => invalid(e),
                }
            }
            AdminCommand::ForceOpen => {
                lookup.force_open();
                AdminResult::Ack
            }
            AdminCommand::ForceClose => {
                lookup.force_close();
                AdminResult::Ack
            }
            AdminCommand::ResetBreakerMetrics => {
                lookup.reset_breaker_metrics();
                AdminResult::Ack
            }
            AdminCommand::BreakerStatus => to_value(&lookup.breaker_status()),
            AdminCommand::Refresh { plate } => match lookup.refresh(&plate).await {
                Ok(record) => to_value(&record),
                Err(e) if e.is_invalid_plate() => invalid(e),
                Err(e) => AdminResult::Error(AdminFailure::Unavailable { msg: e.to_string() }),
            },
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> AdminResult {
    match serde_json::to_value(value) {
        Ok(v) => AdminResult::Value(v),
        Err(e) => AdminResult::Error(AdminFailure::Internal { msg: e.to_string() }),
    }
}

fn invalid(msg: impl fmt::Display) -> AdminResult {
    AdminResult::Error(AdminFailure::InvalidArgs { msg: msg.to_string() })
}

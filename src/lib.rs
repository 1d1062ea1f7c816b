#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # vehicle-lookup
//!
//! Resilient licence-plate lookups against an external vehicle registry that
//! is slow, unreliable and rate limited.
//!
//! ## Features
//!
//! - **Plate validation** for legacy (`ABC1234`) and Mercosul (`BRA2E19`) layouts
//! - **TTL cache** of registry results, sharded for concurrent access
//! - **Per-client rate limiting** with fixed windows and `X-RateLimit-*` metadata
//! - **Circuit breaker** with an explicit half-open trial and operator overrides
//! - **Graceful degradation**: registry trouble yields a `manual` record, never an error
//! - **tower middleware** that enriches parts-request payloads in place
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vehicle_lookup::{LookupConfig, LookupOutcome, VehicleLookup};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let lookup = VehicleLookup::from_config(LookupConfig::from_env()?)?;
//!
//! match lookup.lookup("abc-1234", "203.0.113.9").await {
//!     LookupOutcome::Success(record) => println!("{} via {}", record.plate(), record.origin()),
//!     LookupOutcome::ManualFallback(record) => println!("fill in by hand: {:?}", record.fallback_reason()),
//!     LookupOutcome::RateLimited(info) => println!("retry in {}s", info.retry_after_secs),
//!     LookupOutcome::InvalidInput(err) => println!("bad plate: {err}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dynamic_config;
pub mod error;
pub mod lookup;
pub mod middleware;
pub mod plate;
pub mod prelude;
pub mod rate_limit;
pub mod registry;
pub mod vehicle;

// Re-exports
pub use admin::{AdminCommand, AdminFailure, AdminHandler, AdminResult, LookupStats};
pub use cache::{CacheConfig, CacheStats, VehicleCache};
pub use circuit_breaker::{
    BreakerStatus, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, Environment, LookupConfig};
pub use error::LookupError;
pub use lookup::{LookupOutcome, VehicleLookup, VehicleLookupBuilder};
pub use middleware::{InterceptError, PartsRequest, Rejection, VehicleLookupLayer};
pub use plate::{normalize, Plate, PlateError, PlateFormat};
pub use rate_limit::{Decision, FixedWindowLimiter, RateLimitInfo, RateLimitPolicy, RateLimiter};
pub use registry::{HttpRegistryClient, RegistryConfig, RegistryError, VehicleRegistry};
pub use vehicle::{FallbackReason, Origin, VehicleCategory, VehicleDetails, VehicleRecord};

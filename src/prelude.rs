//! Convenient re-exports for wiring and calling the lookup service.
pub use crate::{
    admin::{AdminCommand, AdminHandler, AdminResult},
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    config::{Environment, LookupConfig},
    lookup::{LookupOutcome, VehicleLookup},
    middleware::{InterceptError, PartsRequest, Rejection, VehicleLookupLayer},
    plate::Plate,
    rate_limit::{RateLimitInfo, RateLimitPolicy},
    registry::{HttpRegistryClient, RegistryConfig, VehicleRegistry},
    vehicle::{Origin, VehicleDetails, VehicleRecord},
    LookupError,
};

//! Errors that cross the lookup boundary.

use crate::plate::PlateError;
use crate::rate_limit::RateLimitInfo;
use crate::vehicle::FallbackReason;

/// Failure of a strict lookup.
///
/// Only malformed plates and exhausted quotas reach callers of
/// [`VehicleLookup::lookup_plate`](crate::VehicleLookup::lookup_plate); registry
/// trouble there becomes a degraded record instead.
/// [`VehicleLookup::refresh`](crate::VehicleLookup::refresh) has no fallback and
/// reports it as [`LookupError::RegistryUnavailable`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("invalid plate: {0}")]
    InvalidPlateFormat(#[from] PlateError),
    #[error(
        "rate limit exceeded for {client}: {count}/{max} lookups, retry in {retry}s",
        client = .0.client_id,
        count = .0.current_count,
        max = .0.max_requests,
        retry = .0.retry_after_secs
    )]
    RateLimitExceeded(RateLimitInfo),
    #[error("vehicle registry unavailable: {reason}")]
    RegistryUnavailable { reason: FallbackReason },
}

impl LookupError {
    pub fn is_invalid_plate(&self) -> bool {
        matches!(self, LookupError::InvalidPlateFormat(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LookupError::RateLimitExceeded(_))
    }

    pub fn is_registry_unavailable(&self) -> bool {
        matches!(self, LookupError::RegistryUnavailable { .. })
    }

    /// Quota metadata when rate limited.
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match self {
            LookupError::RateLimitExceeded(info) => Some(info),
            _ => None,
        }
    }
}

//! Vehicle records and their provenance.

use crate::plate::Plate;
use crate::rate_limit::RateLimitInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broad vehicle category reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleCategory {
    Car,
    Motorcycle,
    Truck,
    Van,
    Bus,
    #[default]
    Other,
}

impl VehicleCategory {
    /// Map a free-text registry label (Portuguese or English, any case) onto a category.
    pub fn from_label(raw: &str) -> Self {
        let label = raw.trim().to_lowercase();
        match label.as_str() {
            "car" | "carro" | "automovel" | "automóvel" | "passeio" => Self::Car,
            "motorcycle" | "moto" | "motocicleta" | "motoneta" | "ciclomotor" => Self::Motorcycle,
            "truck" | "caminhao" | "caminhão" | "caminhao trator" | "caminhão trator" => {
                Self::Truck
            }
            "van" | "utilitario" | "utilitário" | "camioneta" | "furgao" | "furgão" => Self::Van,
            "bus" | "onibus" | "ônibus" | "microonibus" | "micro-ônibus" | "micro-onibus" => {
                Self::Bus
            }
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Truck => "truck",
            Self::Van => "van",
            Self::Bus => "bus",
            Self::Other => "other",
        }
    }
}

/// Where the attributes of a [`VehicleRecord`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Fetched from the registry during this lookup.
    Api,
    /// Served from the in-process cache.
    Cache,
    /// No registry data; the caller fills the attributes in by hand.
    Manual,
    /// No registry data, but the caller already supplied some attributes.
    ApiComFallback,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Api => "api",
            Origin::Cache => "cache",
            Origin::Manual => "manual",
            Origin::ApiComFallback => "api_com_fallback",
        }
    }

    /// True for the degraded origins.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Origin::Manual | Origin::ApiComFallback)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vehicle attributes. Every field is optional: registries omit data and
/// fallback records may carry nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacture_year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<VehicleCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chassis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_number: Option<String>,
}

impl VehicleDetails {
    /// True when no attribute is present.
    pub fn is_empty(&self) -> bool {
        self.make.is_none()
            && self.model.is_none()
            && self.manufacture_year.is_none()
            && self.model_year.is_none()
            && self.category.is_none()
            && self.color.is_none()
            && self.chassis.is_none()
            && self.registration_number.is_none()
    }
}

/// Why a lookup degraded to caller-supplied data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// The request carried no plate.
    MissingPlate,
    /// The breaker refused the call.
    CircuitOpen {
        /// Time until the breaker admits a trial call, if known.
        retry_in_ms: Option<u64>,
    },
    /// The registry did not answer within the timeout.
    RegistryTimeout {
        timeout_ms: u64,
    },
    /// The registry answered with a non-2xx status.
    RegistryHttp {
        status: u16,
    },
    /// No credentials or base URL configured.
    RegistryNotConfigured,
    /// Connection or decoding failure.
    RegistryTransport {
        message: String,
    },
    /// Something inside the lookup path failed unexpectedly.
    Internal {
        message: String,
    },
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::MissingPlate => write!(f, "no plate supplied"),
            FallbackReason::CircuitOpen { retry_in_ms: Some(ms) } => {
                write!(f, "circuit open (retry in {ms} ms)")
            }
            FallbackReason::CircuitOpen { retry_in_ms: None } => write!(f, "circuit open"),
            FallbackReason::RegistryTimeout { timeout_ms } => {
                write!(f, "registry timed out after {timeout_ms} ms")
            }
            FallbackReason::RegistryHttp { status } => write!(f, "registry returned HTTP {status}"),
            FallbackReason::RegistryNotConfigured => write!(f, "registry not configured"),
            FallbackReason::RegistryTransport { message } => {
                write!(f, "registry transport error: {message}")
            }
            FallbackReason::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// Opaque provenance attached to every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// When the record was produced (epoch millis).
    pub timestamp: u64,
    /// Registry round-trip time, for `api` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Age of the cached entry, for `cache` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u64>,
    /// Populated only on degraded records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    /// Caller's quota after this lookup, when it was counted against the limiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

/// Result of a plate lookup. Immutable; every lookup yields a fresh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    plate: String,
    #[serde(flatten)]
    details: VehicleDetails,
    origin: Origin,
    metadata: Provenance,
}

impl VehicleRecord {
    /// Record built from a successful registry response.
    pub fn from_registry(
        plate: &Plate,
        details: VehicleDetails,
        latency: Duration,
        now_millis: u64,
    ) -> Self {
        Self {
            plate: plate.as_str().to_owned(),
            details,
            origin: Origin::Api,
            metadata: Provenance {
                timestamp: now_millis,
                latency_ms: Some(crate::clock::duration_millis(latency)),
                ..Provenance::default()
            },
        }
    }

    /// Degraded record. Origin is `api_com_fallback` when the caller already
    /// supplied attributes, `manual` otherwise.
    pub fn fallback(
        plate: Option<&Plate>,
        supplied: Option<VehicleDetails>,
        reason: FallbackReason,
        now_millis: u64,
    ) -> Self {
        let details = supplied.unwrap_or_default();
        let origin = if details.is_empty() { Origin::Manual } else { Origin::ApiComFallback };
        Self {
            plate: plate.map(|p| p.as_str().to_owned()).unwrap_or_default(),
            details,
            origin,
            metadata: Provenance {
                timestamp: now_millis,
                fallback_reason: Some(reason),
                ..Provenance::default()
            },
        }
    }

    /// Copy of a cached record re-tagged as served from cache.
    pub fn served_from_cache(&self, age_millis: u64, now_millis: u64) -> Self {
        Self {
            plate: self.plate.clone(),
            details: self.details.clone(),
            origin: Origin::Cache,
            metadata: Provenance {
                timestamp: now_millis,
                cache_age_ms: Some(age_millis),
                ..Provenance::default()
            },
        }
    }

    pub(crate) fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.metadata.rate_limit = Some(info);
        self
    }

    /// Canonical plate; empty only for records produced without a plate.
    pub fn plate(&self) -> &str {
        &self.plate
    }

    pub fn details(&self) -> &VehicleDetails {
        &self.details
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn metadata(&self) -> &Provenance {
        &self.metadata
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.metadata.fallback_reason.as_ref()
    }

    /// Quota metadata for `X-RateLimit-*` response headers; `None` for cache
    /// hits and for lookups that never reached the limiter.
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.metadata.rate_limit.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate() -> Plate {
        Plate::parse("ABC1234").unwrap()
    }

    #[test]
    fn category_labels_map_from_portuguese() {
        assert_eq!(VehicleCategory::from_label("AUTOMOVEL"), VehicleCategory::Car);
        assert_eq!(VehicleCategory::from_label("Motocicleta"), VehicleCategory::Motorcycle);
        assert_eq!(VehicleCategory::from_label("caminhão"), VehicleCategory::Truck);
        assert_eq!(VehicleCategory::from_label("ônibus"), VehicleCategory::Bus);
        assert_eq!(VehicleCategory::from_label("trator"), VehicleCategory::Other);
    }

    #[test]
    fn fallback_origin_depends_on_supplied_data() {
        let manual = VehicleRecord::fallback(
            Some(&plate()),
            None,
            FallbackReason::CircuitOpen { retry_in_ms: None },
            1,
        );
        assert_eq!(manual.origin(), Origin::Manual);

        let partial = VehicleDetails { make: Some("FIAT".into()), ..VehicleDetails::default() };
        let with_data = VehicleRecord::fallback(
            Some(&plate()),
            Some(partial),
            FallbackReason::RegistryHttp { status: 503 },
            1,
        );
        assert_eq!(with_data.origin(), Origin::ApiComFallback);
        assert_eq!(with_data.details().make.as_deref(), Some("FIAT"));
    }

    #[test]
    fn serialises_origin_and_flattened_details() {
        let details = VehicleDetails {
            make: Some("VW".into()),
            model_year: Some(2020),
            category: Some(VehicleCategory::Car),
            ..VehicleDetails::default()
        };
        let record =
            VehicleRecord::from_registry(&plate(), details, Duration::from_millis(42), 7);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["origin"], "api");
        assert_eq!(json["make"], "VW");
        assert_eq!(json["category"], "car");
        assert_eq!(json["metadata"]["latency_ms"], 42);

        let cached = record.served_from_cache(500, 9);
        let json = serde_json::to_value(&cached).unwrap();
        assert_eq!(json["origin"], "cache");
        assert_eq!(json["metadata"]["cache_age_ms"], 500);
    }

    #[test]
    fn fallback_reason_serialises_tagged() {
        let json = serde_json::to_value(FallbackReason::RegistryHttp { status: 502 }).unwrap();
        assert_eq!(json["kind"], "registry_http");
        assert_eq!(json["status"], 502);
    }
}

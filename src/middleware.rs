//! tower middleware that resolves vehicle data on parts-request creation.
//!
//! [`VehicleLookupLayer`] wraps the service that persists a parts request. Before
//! the inner service runs, the plate in the payload is looked up and the vehicle
//! fields are merged into the payload together with provenance:
//!
//! - registry and cache data overwrite whatever the caller sent
//! - fallback data only fills fields the caller left out
//! - `origem_dados_veiculo` carries the origin, `metadados_veiculo` the metadata
//!
//! A spent quota or a malformed plate short-circuits with a [`Rejection`]. Any
//! other failure, including a panic in the lookup path, degrades to manual
//! entry and the request continues.

use crate::lookup::{panic_message, LookupOutcome, VehicleLookup};
use crate::plate::{Plate, PlateError};
use crate::rate_limit::RateLimitInfo;
use crate::vehicle::{FallbackReason, VehicleCategory, VehicleDetails, VehicleRecord};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

pub const FIELD_PLATE: &str = "placa";
pub const FIELD_PLATE_ALT: &str = "plate";
pub const FIELD_MAKE: &str = "marca";
pub const FIELD_MODEL: &str = "modelo";
pub const FIELD_MANUFACTURE_YEAR: &str = "ano_fabricacao";
pub const FIELD_MODEL_YEAR: &str = "ano_modelo";
pub const FIELD_CATEGORY: &str = "categoria";
pub const FIELD_COLOR: &str = "cor";
pub const FIELD_CHASSIS: &str = "chassi";
pub const FIELD_REGISTRATION: &str = "renavam";
pub const FIELD_ORIGIN: &str = "origem_dados_veiculo";
pub const FIELD_METADATA: &str = "metadados_veiculo";

/// Client identifier used when the request carries no address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Inbound parts-request creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartsRequest {
    pub client_ip: Option<String>,
    pub payload: Map<String, Value>,
}

impl PartsRequest {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self { client_ip: None, payload }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    fn raw_plate(&self) -> String {
        [FIELD_PLATE, FIELD_PLATE_ALT]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned()
    }

    // Vehicle fields the caller already filled in.
    fn supplied_details(&self) -> Option<VehicleDetails> {
        let text = |key: &str| match self.payload.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_owned()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let year = |key: &str| match self.payload.get(key) {
            Some(Value::Number(n)) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        let details = VehicleDetails {
            make: text(FIELD_MAKE),
            model: text(FIELD_MODEL),
            manufacture_year: year(FIELD_MANUFACTURE_YEAR),
            model_year: year(FIELD_MODEL_YEAR),
            category: text(FIELD_CATEGORY).map(|c| VehicleCategory::from_label(&c)),
            color: text(FIELD_COLOR),
            chassis: text(FIELD_CHASSIS),
            registration_number: text(FIELD_REGISTRATION),
        };
        (!details.is_empty()).then_some(details)
    }
}

/// Why a request was turned away before reaching the inner service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    RateLimited { info: RateLimitInfo },
    InvalidPlate { error: PlateError },
}

impl Rejection {
    /// HTTP status for the response.
    pub fn status(&self) -> u16 {
        match self {
            Rejection::RateLimited { .. } => 429,
            Rejection::InvalidPlate { .. } => 400,
        }
    }

    pub fn headers(&self) -> BTreeMap<&'static str, String> {
        match self {
            Rejection::RateLimited { info } => info.headers(),
            Rejection::InvalidPlate { .. } => BTreeMap::new(),
        }
    }

    /// JSON response body.
    pub fn body(&self) -> Value {
        match self {
            Rejection::RateLimited { info } => json!({
                "error": "rate_limit_exceeded",
                "message": format!(
                    "Vehicle lookup limit reached ({}/{}). {}",
                    info.current_count,
                    info.max_requests,
                    retry_hint(info.retry_after_secs)
                ),
                "current_count": info.current_count,
                "max_requests": info.max_requests,
                "reset_time": info.reset_time,
                "retry_after_secs": info.retry_after_secs,
            }),
            Rejection::InvalidPlate { error } => json!({
                "error": "invalid_plate",
                "message": error.to_string(),
            }),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::RateLimited { info } => write!(
                f,
                "rate limited: {}/{} lookups, {}",
                info.current_count,
                info.max_requests,
                retry_hint(info.retry_after_secs)
            ),
            Rejection::InvalidPlate { error } => write!(f, "invalid plate: {error}"),
        }
    }
}

fn retry_hint(secs: u64) -> String {
    match secs {
        0..=59 => format!("Try again in {secs} seconds."),
        _ => format!("Try again in {} minutes.", secs.div_ceil(60)),
    }
}

/// Error returned by [`VehicleLookupService`].
#[derive(Debug)]
pub enum InterceptError<E> {
    /// The request was answered here; the inner service never ran.
    Rejected(Rejection),
    /// The inner service failed.
    Inner(E),
}

impl<E> InterceptError<E> {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            InterceptError::Rejected(r) => Some(r),
            InterceptError::Inner(_) => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            InterceptError::Inner(e) => Some(e),
            InterceptError::Rejected(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for InterceptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::Rejected(r) => write!(f, "{}", r),
            InterceptError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for InterceptError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterceptError::Inner(e) => Some(e),
            InterceptError::Rejected(_) => None,
        }
    }
}

/// Layer that enriches parts requests with vehicle data.
#[derive(Debug, Clone)]
pub struct VehicleLookupLayer {
    lookup: VehicleLookup,
}

impl VehicleLookupLayer {
    pub fn new(lookup: VehicleLookup) -> Self {
        Self { lookup }
    }
}

impl<S> Layer<S> for VehicleLookupLayer {
    type Service = VehicleLookupService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        VehicleLookupService { inner, lookup: self.lookup.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct VehicleLookupService<S> {
    inner: S,
    lookup: VehicleLookup,
}

impl<S> Service<PartsRequest> for VehicleLookupService<S>
where
    S: Service<PartsRequest> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = InterceptError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(InterceptError::Inner)
    }

    fn call(&mut self, mut req: PartsRequest) -> Self::Future {
        let lookup = self.lookup.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let raw_plate = req.raw_plate();
            let client_ip = req.client_ip.clone().unwrap_or_else(|| UNKNOWN_CLIENT.to_owned());
            let supplied = req.supplied_details();

            let outcome = AssertUnwindSafe(lookup.lookup_with_hint(
                &raw_plate,
                &client_ip,
                supplied.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                tracing::error!(
                    client_ip = %client_ip,
                    error = %message,
                    "vehicle lookup panicked, continuing with manual entry"
                );
                let plate = Plate::parse(&raw_plate).ok();
                LookupOutcome::ManualFallback(VehicleRecord::fallback(
                    plate.as_ref(),
                    supplied,
                    FallbackReason::Internal { message },
                    lookup.now(),
                ))
            });

            match outcome {
                LookupOutcome::RateLimited(info) => {
                    Err(InterceptError::Rejected(Rejection::RateLimited { info }))
                }
                LookupOutcome::InvalidInput(error) => {
                    Err(InterceptError::Rejected(Rejection::InvalidPlate { error }))
                }
                LookupOutcome::Success(record) | LookupOutcome::ManualFallback(record) => {
                    merge_record(&record, &mut req.payload);
                    inner.call(req).await.map_err(InterceptError::Inner)
                }
            }
        })
    }
}

fn merge_record(record: &VehicleRecord, payload: &mut Map<String, Value>) {
    let overwrite = !record.origin().is_fallback();
    let details = record.details();

    if !record.plate().is_empty() {
        payload.insert(FIELD_PLATE.to_owned(), Value::from(record.plate()));
    }
    let fields = [
        (FIELD_MAKE, details.make.clone().map(Value::from)),
        (FIELD_MODEL, details.model.clone().map(Value::from)),
        (FIELD_MANUFACTURE_YEAR, details.manufacture_year.map(Value::from)),
        (FIELD_MODEL_YEAR, details.model_year.map(Value::from)),
        (FIELD_CATEGORY, details.category.map(|c| Value::from(c.as_str()))),
        (FIELD_COLOR, details.color.clone().map(Value::from)),
        (FIELD_CHASSIS, details.chassis.clone().map(Value::from)),
        (FIELD_REGISTRATION, details.registration_number.clone().map(Value::from)),
    ];
    for (key, value) in fields {
        let Some(value) = value else { continue };
        let absent = payload.get(key).filter(|v| !v.is_null()).is_none();
        if overwrite || absent {
            payload.insert(key.to_owned(), value);
        }
    }

    payload.insert(FIELD_ORIGIN.to_owned(), Value::from(record.origin().as_str()));
    let metadata = serde_json::to_value(record.metadata()).unwrap_or(Value::Null);
    payload.insert(FIELD_METADATA.to_owned(), metadata);
}

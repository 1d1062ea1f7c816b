//! Client for the external vehicle registry.
//!
//! [`VehicleRegistry`] is the seam the orchestrator calls through; production
//! wiring uses [`HttpRegistryClient`], tests substitute scripted
//! implementations. This layer does one bounded call and classifies the
//! failure. It never caches, rate limits, or retries.

use crate::plate::Plate;
use crate::vehicle::{FallbackReason, VehicleCategory, VehicleDetails};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

/// Default upper bound on one registry call.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a registry call produced no data.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry did not answer within {timeout:?} (gave up after {elapsed:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    #[error("registry answered HTTP {status}")]
    Http { status: u16 },
    /// Nothing was sent.
    #[error("registry client is not configured: missing {missing}")]
    NotConfigured { missing: &'static str },
    #[error("registry transport failure: {0}")]
    Transport(String),
    #[error("registry payload could not be decoded: {0}")]
    Decode(String),
}

impl From<&RegistryError> for FallbackReason {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::Timeout { timeout, .. } => {
                FallbackReason::RegistryTimeout { timeout_ms: crate::clock::duration_millis(*timeout) }
            }
            RegistryError::Http { status } => FallbackReason::RegistryHttp { status: *status },
            RegistryError::NotConfigured { .. } => FallbackReason::RegistryNotConfigured,
            RegistryError::Transport(message) | RegistryError::Decode(message) => {
                FallbackReason::RegistryTransport { message: message.clone() }
            }
        }
    }
}

/// Source of vehicle attributes for a plate.
#[async_trait]
pub trait VehicleRegistry: Send + Sync + fmt::Debug {
    async fn fetch(&self, plate: &Plate) -> Result<VehicleDetails, RegistryError>;
}

/// Where and how to reach the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { base_url: None, api_token: None, timeout: DEFAULT_REGISTRY_TIMEOUT }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// reqwest-backed registry client.
///
/// Issues `GET {base_url}/consulta/{plate}` with a bearer token. The whole
/// exchange, body included, is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vehicle-lookup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RegistryError::Transport(e.to_string()))?;
        Ok(Self::with_client(config, client))
    }

    /// Reuse an existing connection pool.
    pub fn with_client(config: RegistryConfig, client: reqwest::Client) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn endpoint(&self, plate: &Plate) -> Result<(String, &str), RegistryError> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(RegistryError::NotConfigured { missing: "base_url" })?;
        let token = self
            .config
            .api_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or(RegistryError::NotConfigured { missing: "api_token" })?;
        Ok((format!("{}/consulta/{}", base_url.trim_end_matches('/'), plate), token))
    }
}

#[async_trait]
impl VehicleRegistry for HttpRegistryClient {
    async fn fetch(&self, plate: &Plate) -> Result<VehicleDetails, RegistryError> {
        let (url, token) = self.endpoint(plate)?;
        let timeout = self.config.timeout;
        let started = Instant::now();

        let call = async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| RegistryError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(RegistryError::Http { status: status.as_u16() });
            }

            let payload: RegistryPayload =
                response.json().await.map_err(|e| RegistryError::Decode(e.to_string()))?;
            Ok(payload.into_details())
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout { elapsed: started.elapsed(), timeout }),
        }
    }
}

/// Registry wire format. Field names follow the registry's Portuguese
/// vocabulary; upper-case variants appear in some responses.
#[derive(Debug, Default, Deserialize)]
struct RegistryPayload {
    #[serde(default, alias = "MARCA", deserialize_with = "lenient_text")]
    marca: Option<String>,
    #[serde(default, alias = "MODELO", deserialize_with = "lenient_text")]
    modelo: Option<String>,
    #[serde(default, alias = "anoFabricacao", alias = "ANO", deserialize_with = "lenient_year")]
    ano: Option<u16>,
    #[serde(
        default,
        rename = "anoModelo",
        alias = "ano_modelo",
        alias = "ANOMODELO",
        deserialize_with = "lenient_year"
    )]
    ano_modelo: Option<u16>,
    #[serde(default, alias = "COR", deserialize_with = "lenient_text")]
    cor: Option<String>,
    #[serde(default, alias = "CHASSI", deserialize_with = "lenient_text")]
    chassi: Option<String>,
    #[serde(default, alias = "RENAVAM", deserialize_with = "lenient_text")]
    renavam: Option<String>,
    #[serde(default, alias = "segmento", alias = "TIPO", deserialize_with = "lenient_text")]
    tipo: Option<String>,
}

impl RegistryPayload {
    fn into_details(self) -> VehicleDetails {
        VehicleDetails {
            make: self.marca,
            model: self.modelo,
            manufacture_year: self.ano,
            model_year: self.ano_modelo,
            category: self.tipo.as_deref().map(VehicleCategory::from_label),
            color: self.cor,
            chassis: self.chassi,
            registration_number: self.renavam,
        }
    }
}

// Strings or numbers; blank strings read as absent.
fn lenient_text<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(de)? {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// `2019`, `"2019"` and `"2019/2020"` all read as 2019.
fn lenient_year<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u16>, D::Error> {
    Ok(match Option::<Value>::deserialize(de)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|y| u16::try_from(y).ok()),
        Some(Value::String(s)) => {
            s.trim().split(|c: char| !c.is_ascii_digit()).next().and_then(|d| d.parse().ok())
        }
        _ => None,
    })
}

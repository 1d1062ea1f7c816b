//! Environment-sensitive configuration.
//!
//! [`LookupConfig::for_environment`] yields the defaults for a deployment
//! tier; [`LookupConfig::from_env`] layers `VEHICLE_*` variables over them.

use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limit::{RateLimitPolicy, DEFAULT_WINDOW};
use crate::registry::RegistryConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_ENVIRONMENT: &str = "VEHICLE_LOOKUP_ENV";
pub const ENV_ENVIRONMENT_FALLBACK: &str = "APP_ENV";
pub const ENV_REGISTRY_URL: &str = "VEHICLE_REGISTRY_URL";
pub const ENV_REGISTRY_TOKEN: &str = "VEHICLE_REGISTRY_TOKEN";
pub const ENV_REGISTRY_TIMEOUT_MS: &str = "VEHICLE_REGISTRY_TIMEOUT_MS";
pub const ENV_CACHE_TTL_SECS: &str = "VEHICLE_CACHE_TTL_SECS";
pub const ENV_RATE_LIMIT_MAX: &str = "VEHICLE_RATE_LIMIT_MAX";
pub const ENV_RATE_LIMIT_WINDOW_SECS: &str = "VEHICLE_RATE_LIMIT_WINDOW_SECS";
pub const ENV_BREAKER_FAILURE_THRESHOLD: &str = "VEHICLE_BREAKER_FAILURE_THRESHOLD";
pub const ENV_BREAKER_COOLDOWN_SECS: &str = "VEHICLE_BREAKER_COOLDOWN_SECS";

const PRODUCTION_MAX_LOOKUPS: u32 = 30;
const RELAXED_MAX_LOOKUPS: u32 = 1000;

/// Deployment tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" | "testing" => Ok(Environment::Test),
            _ => Err(ConfigError::Invalid {
                key: ENV_ENVIRONMENT,
                value: s.to_owned(),
                reason: "expected production, development or test".into(),
            }),
        }
    }
}

/// Configuration errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

/// Everything needed to wire a [`VehicleLookup`](crate::VehicleLookup).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupConfig {
    pub environment: Environment,
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitPolicy,
    pub breaker: CircuitBreakerConfig,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

impl LookupConfig {
    /// Defaults for `environment`. Production allows 30 lookups per client per
    /// 15 minutes; other tiers allow 1000.
    pub fn for_environment(environment: Environment) -> Self {
        let max_lookups = match environment {
            Environment::Production => PRODUCTION_MAX_LOOKUPS,
            Environment::Development | Environment::Test => RELAXED_MAX_LOOKUPS,
        };
        let rate_limit = RateLimitPolicy::from_parts(max_lookups, DEFAULT_WINDOW);
        Self {
            environment,
            registry: RegistryConfig::default(),
            cache: CacheConfig::default(),
            rate_limit,
            breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to its value.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match var(ENV_ENVIRONMENT).or_else(|| var(ENV_ENVIRONMENT_FALLBACK)) {
            Some(raw) => raw.parse()?,
            None => Environment::default(),
        };
        let mut config = Self::for_environment(environment);

        config.registry.base_url = var(ENV_REGISTRY_URL);
        config.registry.api_token = var(ENV_REGISTRY_TOKEN);
        let timeout_ms = var(ENV_REGISTRY_TIMEOUT_MS);
        if let Some(ms) = parse_positive::<u64>(ENV_REGISTRY_TIMEOUT_MS, timeout_ms)? {
            config.registry.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_positive::<u64>(ENV_CACHE_TTL_SECS, var(ENV_CACHE_TTL_SECS))? {
            config.cache.ttl = Duration::from_secs(secs);
        }

        let max = parse_positive::<u32>(ENV_RATE_LIMIT_MAX, var(ENV_RATE_LIMIT_MAX))?
            .unwrap_or(config.rate_limit.max_requests());
        let window_secs = var(ENV_RATE_LIMIT_WINDOW_SECS);
        let window = parse_positive::<u64>(ENV_RATE_LIMIT_WINDOW_SECS, window_secs)?
            .map(Duration::from_secs)
            .unwrap_or(config.rate_limit.window());
        config.rate_limit = RateLimitPolicy::new(max, window).map_err(|e| ConfigError::Invalid {
            key: ENV_RATE_LIMIT_MAX,
            value: max.to_string(),
            reason: e.to_string(),
        })?;

        let threshold = parse_positive::<usize>(
            ENV_BREAKER_FAILURE_THRESHOLD,
            var(ENV_BREAKER_FAILURE_THRESHOLD),
        )?
        .unwrap_or(config.breaker.failure_threshold());
        let cooldown_secs = var(ENV_BREAKER_COOLDOWN_SECS);
        let cooldown = parse_positive::<u64>(ENV_BREAKER_COOLDOWN_SECS, cooldown_secs)?
            .map(Duration::from_secs)
            .unwrap_or(config.breaker.cooldown());
        config.breaker = CircuitBreakerConfig::new(threshold, cooldown).map_err(|e| {
            ConfigError::Invalid {
                key: ENV_BREAKER_FAILURE_THRESHOLD,
                value: threshold.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(config)
    }
}

fn parse_positive<T>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let Some(raw) = raw else { return Ok(None) };
    let parsed = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if parsed == T::default() {
        let reason = "must be greater than zero".into();
        return Err(ConfigError::Invalid { key, value: raw, reason });
    }
    Ok(Some(parsed))
}

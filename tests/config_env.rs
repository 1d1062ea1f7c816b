use std::collections::HashMap;
use std::time::Duration;
use vehicle_lookup::config::{
    ENV_BREAKER_COOLDOWN_SECS, ENV_BREAKER_FAILURE_THRESHOLD, ENV_CACHE_TTL_SECS, ENV_ENVIRONMENT,
    ENV_ENVIRONMENT_FALLBACK, ENV_RATE_LIMIT_MAX, ENV_RATE_LIMIT_WINDOW_SECS, ENV_REGISTRY_TIMEOUT_MS,
    ENV_REGISTRY_TOKEN, ENV_REGISTRY_URL,
};
use vehicle_lookup::{ConfigError, Environment, LookupConfig};

fn load(pairs: &[(&str, &str)]) -> Result<LookupConfig, ConfigError> {
    let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
    LookupConfig::from_source(|key: &str| vars.get(key).map(|v| (*v).to_owned()))
}

#[test]
fn empty_source_yields_development_defaults() {
    let config = load(&[]).unwrap();
    assert_eq!(config.environment, Environment::Development);
    assert_eq!(config, LookupConfig::for_environment(Environment::Development));
    assert_eq!(config.registry.base_url, None);
}

#[test]
fn production_tier_and_overrides() {
    let config = load(&[
        (ENV_ENVIRONMENT, "production"),
        (ENV_REGISTRY_URL, "https://registry.example.com/api"),
        (ENV_REGISTRY_TOKEN, "abc"),
        (ENV_REGISTRY_TIMEOUT_MS, "2500"),
        (ENV_CACHE_TTL_SECS, "3600"),
        (ENV_BREAKER_FAILURE_THRESHOLD, "3"),
        (ENV_BREAKER_COOLDOWN_SECS, "10"),
    ])
    .unwrap();

    assert_eq!(config.environment, Environment::Production);
    assert_eq!(config.rate_limit.max_requests(), 30);
    assert_eq!(config.rate_limit.window(), Duration::from_secs(15 * 60));
    assert_eq!(config.registry.base_url.as_deref(), Some("https://registry.example.com/api"));
    assert_eq!(config.registry.api_token.as_deref(), Some("abc"));
    assert_eq!(config.registry.timeout, Duration::from_millis(2500));
    assert_eq!(config.cache.ttl, Duration::from_secs(3600));
    assert_eq!(config.breaker.failure_threshold(), 3);
    assert_eq!(config.breaker.cooldown(), Duration::from_secs(10));
}

#[test]
fn app_env_is_the_fallback_tier_variable() {
    let config = load(&[(ENV_ENVIRONMENT_FALLBACK, "test")]).unwrap();
    assert_eq!(config.environment, Environment::Test);
    assert_eq!(config.rate_limit.max_requests(), 1000);

    let config =
        load(&[(ENV_ENVIRONMENT, "prod"), (ENV_ENVIRONMENT_FALLBACK, "development")]).unwrap();
    assert_eq!(config.environment, Environment::Production);
}

#[test]
fn explicit_quota_overrides_tier() {
    let config = load(&[
        (ENV_ENVIRONMENT, "production"),
        (ENV_RATE_LIMIT_MAX, "5"),
        (ENV_RATE_LIMIT_WINDOW_SECS, "60"),
    ])
    .unwrap();
    assert_eq!(config.rate_limit.max_requests(), 5);
    assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
}

#[test]
fn invalid_values_name_the_variable() {
    let err = load(&[(ENV_REGISTRY_TIMEOUT_MS, "soon")]).unwrap_err();
    let ConfigError::Invalid { key, value, .. } = err;
    assert_eq!(key, ENV_REGISTRY_TIMEOUT_MS);
    assert_eq!(value, "soon");

    let err = load(&[(ENV_BREAKER_COOLDOWN_SECS, "0")]).unwrap_err();
    assert!(err.to_string().contains(ENV_BREAKER_COOLDOWN_SECS));

    let err = load(&[(ENV_ENVIRONMENT, "staging")]).unwrap_err();
    assert!(err.to_string().contains("staging"));
}

#[test]
fn blank_values_are_ignored() {
    let config = load(&[(ENV_REGISTRY_URL, "  "), (ENV_CACHE_TTL_SECS, "")]).unwrap();
    assert_eq!(config.registry.base_url, None);
    assert_eq!(config.cache.ttl, Duration::from_secs(86_400));
}

//! Process configuration read from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_BRAVE_API_BASE_URL: &str = "https://api.search.brave.com/res/v1";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: String,
    pub port: u16,
    /// `None` is allowed at boot; search requests then fail with a 500.
    pub brave_api_key: Option<String>,
    pub brave_api_base_url: Url,
    /// Freshness window of the request aggregator.
    pub aggregator_window: Duration,
    /// Background sweep period. `None` leaves reaping to `execute`.
    pub aggregator_sweep_interval: Option<Duration>,
    pub outbound_concurrency: usize,
    pub http_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            brave_api_key: None,
            brave_api_base_url: Url::parse(DEFAULT_BRAVE_API_BASE_URL)
                .expect("default base URL is valid"),
            aggregator_window: Duration::from_millis(1000),
            aggregator_sweep_interval: Some(Duration::from_secs(30)),
            outbound_concurrency: 32,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let brave_api_base_url = match get("BRAVE_API_BASE_URL") {
            Some(raw) => Url::parse(raw.trim_end_matches('/')).map_err(|e| ConfigError::Invalid {
                var: "BRAVE_API_BASE_URL",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.brave_api_base_url,
        };

        let sweep_ms: u64 = parse_var(&get, "AGGREGATOR_SWEEP_MS", 30_000)?;

        let outbound_concurrency = parse_var(&get, "OUTBOUND_CONCURRENCY", defaults.outbound_concurrency)?;
        if outbound_concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "OUTBOUND_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let http_timeout_secs: u64 = parse_var(&get, "HTTP_TIMEOUT_SECS", 30)?;
        if http_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "HTTP_TIMEOUT_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_var(&get, "PORT", defaults.port)?,
            brave_api_key: get("BRAVE_API_KEY"),
            brave_api_base_url,
            aggregator_window: Duration::from_millis(parse_var(&get, "AGGREGATOR_WINDOW_MS", 1000)?),
            aggregator_sweep_interval: (sweep_ms > 0).then(|| Duration::from_millis(sweep_ms)),
            outbound_concurrency,
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_var<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:3000");
        assert!(config.brave_api_key.is_none());
        assert_eq!(config.brave_api_base_url.as_str(), DEFAULT_BRAVE_API_BASE_URL);
        assert_eq!(config.aggregator_window, Duration::from_secs(1));
        assert_eq!(config.aggregator_sweep_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.outbound_concurrency, 32);
    }

    #[test]
    fn test_overrides() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("BRAVE_API_KEY", "secret"),
            ("BRAVE_API_BASE_URL", "http://127.0.0.1:9999/res/v1/"),
            ("AGGREGATOR_WINDOW_MS", "250"),
            ("AGGREGATOR_SWEEP_MS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.brave_api_key.as_deref(), Some("secret"));
        assert_eq!(config.brave_api_base_url.as_str(), "http://127.0.0.1:9999/res/v1");
        assert_eq!(config.aggregator_window, Duration::from_millis(250));
        assert!(config.aggregator_sweep_interval.is_none());
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let config = ProxyConfig::from_lookup(lookup(&[("BRAVE_API_KEY", "  ")])).unwrap();
        assert!(config.brave_api_key.is_none());
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = ProxyConfig::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = ProxyConfig::from_lookup(lookup(&[("BRAVE_API_BASE_URL", "not a url")])).unwrap_err();
        assert!(err.to_string().contains("BRAVE_API_BASE_URL"));

        let err = ProxyConfig::from_lookup(lookup(&[("OUTBOUND_CONCURRENCY", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_zero_http_timeout_is_rejected() {
        let err = ProxyConfig::from_lookup(lookup(&[("HTTP_TIMEOUT_SECS", "0")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value '0' for HTTP_TIMEOUT_SECS: must be at least 1"
        );

        let config = ProxyConfig::from_lookup(lookup(&[("HTTP_TIMEOUT_SECS", "5")])).unwrap();
        assert_eq!(config.http_timeout, Duration::from_secs(5));
    }
}

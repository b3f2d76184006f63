//! Client configuration.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::tracker::DEFAULT_UPDATE_CAPACITY;

/// Address the compute service listens on by default.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9090";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the compute service.
    pub address: String,
    pub connect_timeout: Duration,
    pub max_frame_length: usize,
    /// Buffer size of the job update broadcast.
    pub update_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `CATE_WEBAPI_ADDR`, `CATE_WEBAPI_CONNECT_TIMEOUT`
    /// (seconds) and `CATE_WEBAPI_MAX_FRAME_LENGTH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(address) = lookup("CATE_WEBAPI_ADDR").filter(|s| !s.trim().is_empty()) {
            config.address = address.trim().to_string();
        }

        if let Some(raw) = lookup("CATE_WEBAPI_CONNECT_TIMEOUT") {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => {
                    config.connect_timeout = Duration::from_secs_f64(secs);
                }
                _ => tracing::warn!(value = %raw, "Ignoring invalid CATE_WEBAPI_CONNECT_TIMEOUT"),
            }
        }

        if let Some(raw) = lookup("CATE_WEBAPI_MAX_FRAME_LENGTH") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_length = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid CATE_WEBAPI_MAX_FRAME_LENGTH"),
            }
        }

        config
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }

    pub fn with_update_capacity(mut self, n: usize) -> Self {
        self.update_capacity = n;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.address, "127.0.0.1:9090");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(config.update_capacity, DEFAULT_UPDATE_CAPACITY);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CATE_WEBAPI_ADDR", "cate.example.org:8080"),
            ("CATE_WEBAPI_CONNECT_TIMEOUT", "2.5"),
            ("CATE_WEBAPI_MAX_FRAME_LENGTH", "1024"),
        ]));
        assert_eq!(config.address, "cate.example.org:8080");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_frame_length, 1024);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CATE_WEBAPI_ADDR", "  "),
            ("CATE_WEBAPI_CONNECT_TIMEOUT", "soon"),
            ("CATE_WEBAPI_MAX_FRAME_LENGTH", "0"),
        ]));
        let defaults = ClientConfig::default();
        assert_eq!(config.address, defaults.address);
        assert_eq!(config.connect_timeout, defaults.connect_timeout);
        assert_eq!(config.max_frame_length, defaults.max_frame_length);
    }

    #[test]
    fn builder_pattern() {
        let config = ClientConfig::new("localhost:1")
            .with_connect_timeout(Duration::from_secs(1))
            .with_max_frame_length(10)
            .with_update_capacity(4);
        assert_eq!(config.address, "localhost:1");
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.max_frame_length, 10);
        assert_eq!(config.update_capacity, 4);
        assert_eq!(config.with_address("x:2").address, "x:2");
    }
}

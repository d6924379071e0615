//! Proxy configuration. File loading and flag parsing live with the
//! embedding binary; this is just the deserialized shape plus typed
//! accessors for the stringly-encoded durations.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Failures interpreting configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration string was not of the form `<number><ns|us|ms|s|m|h>`.
    #[error("could not parse duration '{0}'")]
    InvalidDuration(String),
}

/// Everything a forwarding proxy accepts. All fields default to off/empty
/// so partial configuration files deserialize cleanly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// The logical service name to resolve forwarding destinations from.
    pub consul_forward_service_name: String,
    /// How often to re-resolve destinations and rebuild the ring.
    pub consul_refresh_interval: String,
    /// Enable debug logging.
    pub debug: bool,
    /// Expose the profiling endpoints.
    pub enable_profiling: bool,
    /// A fixed downstream address, for deployments without discovery.
    pub forward_address: String,
    /// Bound on each destination's dial-and-send during a forward.
    pub forward_timeout: String,
    /// The address the Forward gRPC service listens on.
    pub grpc_address: String,
    /// The address the HTTP surface listens on.
    pub http_address: String,
    /// Where to report errors.
    pub sentry_dsn: String,
    /// Where to emit this proxy's own telemetry spans.
    pub ssf_destination_address: String,
    /// Where to emit this proxy's own metrics.
    pub stats_address: String,
    /// Where to forward trace spans.
    pub trace_address: String,
}

impl ProxyConfig {
    /// The parsed forward timeout, or None when unset.
    pub fn forward_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        parse_optional_duration(&self.forward_timeout)
    }

    /// The parsed ring refresh cadence, or None when unset.
    pub fn consul_refresh_interval(&self) -> Result<Option<Duration>, ConfigError> {
        parse_optional_duration(&self.consul_refresh_interval)
    }
}

fn parse_optional_duration(value: &str) -> Result<Option<Duration>, ConfigError> {
    if value.is_empty() {
        return Ok(None);
    }
    parse_duration(value).map(Some)
}

// Accepts the common duration spellings: "500ms", "10s", "2m", "1h".
fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| ConfigError::InvalidDuration(value.to_string()))?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(value.to_string()))?;
    let nanos = match unit {
        "ns" => number,
        "us" => number * 1e3,
        "ms" => number * 1e6,
        "s" => number * 1e9,
        "m" => number * 60.0 * 1e9,
        "h" => number * 3_600.0 * 1e9,
        _ => return Err(ConfigError::InvalidDuration(value.to_string())),
    };
    Ok(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use std::time::Duration;

    use super::{ConfigError, ProxyConfig};

    #[test]
    fn partial_configuration_deserializes() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{
                "forward_address": "metrics-global.internal:8128",
                "forward_timeout": "10s",
                "grpc_address": "0.0.0.0:8128"
            }"#,
        )
        .unwrap();
        assert_eq!("metrics-global.internal:8128", config.forward_address);
        assert_eq!(
            Some(Duration::from_secs(10)),
            config.forward_timeout().unwrap()
        );
        assert_eq!(None, config.consul_refresh_interval().unwrap());
        assert!(!config.debug);
    }

    #[test]
    fn duration_spellings() {
        let mut config = ProxyConfig {
            forward_timeout: "500ms".to_string(),
            ..Default::default()
        };
        assert_eq!(
            Some(Duration::from_millis(500)),
            config.forward_timeout().unwrap()
        );

        config.forward_timeout = "2m".to_string();
        assert_eq!(
            Some(Duration::from_secs(120)),
            config.forward_timeout().unwrap()
        );

        config.forward_timeout = "oops".to_string();
        assert_eq!(
            Err(ConfigError::InvalidDuration("oops".to_string())),
            config.forward_timeout()
        );

        config.forward_timeout = "10".to_string();
        assert!(config.forward_timeout().is_err());
    }
}

//! Client configuration.

use std::env;
use std::time::Duration;

use crate::tracing::prelude::*;

/// Cloud endpoint every Homerun feeder talks through.
pub const DEFAULT_ADDRESS: &str = "47.97.92.77:23778";

/// Connection and polling parameters.
///
/// The defaults are the timings the device is known to tolerate; tests
/// shorten them.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// Device endpoint (host:port)
    pub address: String,

    /// Reconnect on close, and after a stall in a non-online phase
    pub auto_reconnect: bool,

    /// Delay between the end of one poll cycle and the start of the next
    pub poll_interval: Duration,

    /// Bound on each throttle wait, before and after a request
    pub request_timeout: Duration,

    /// Granularity of throttle waits
    pub wait_step: Duration,

    /// Delay before the deferred reconnect, also used after a failed connect
    pub reconnect_delay: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            auto_reconnect: true,
            poll_interval: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(3000),
            wait_step: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl FeederConfig {
    /// Defaults, overridden by `HOMERUN_ADDRESS` and
    /// `HOMERUN_AUTO_RECONNECT` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(address) = env::var("HOMERUN_ADDRESS") {
            config.address = address;
        }

        if let Ok(value) = env::var("HOMERUN_AUTO_RECONNECT") {
            match parse_bool(&value) {
                Some(enabled) => config.auto_reconnect = enabled,
                None => warn!(value = %value, "Ignoring invalid HOMERUN_AUTO_RECONNECT"),
            }
        }

        config
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FeederConfig::default();
        assert_eq!(config.address, "47.97.92.77:23778");
        assert!(config.auto_reconnect);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.wait_step, Duration::from_millis(100));
        assert_eq!(config.reconnect_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool(" ON "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("No"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}

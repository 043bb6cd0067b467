use serde::{Deserialize, Serialize};

use crate::error::{InteropError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum number of deferred-release threads alive at once
    pub release_workers: usize,
    /// Name prefix for deferred-release threads
    pub release_thread_name: String,
    /// Device copies allowed in flight on the transfer queue
    pub max_transfers_in_flight: usize,
    /// Validate each array against the stream schema on export
    pub validate_streams: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            release_workers: 4,
            release_thread_name: "cdata-release".to_string(),
            max_transfers_in_flight: 8,
            validate_streams: true,
        }
    }
}

impl BridgeConfig {
    /// Defaults, overridden by `CDATA_RELEASE_WORKERS`, `CDATA_MAX_TRANSFERS`
    /// and `CDATA_VALIDATE_STREAMS`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("CDATA_RELEASE_WORKERS") {
            self.release_workers = parse_count("CDATA_RELEASE_WORKERS", &v)?;
        }
        if let Some(v) = lookup("CDATA_MAX_TRANSFERS") {
            self.max_transfers_in_flight = parse_count("CDATA_MAX_TRANSFERS", &v)?;
        }
        if let Some(v) = lookup("CDATA_VALIDATE_STREAMS") {
            self.validate_streams = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(config_error("CDATA_VALIDATE_STREAMS", &v)),
            };
        }
        Ok(self)
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(config_error(key, value)),
    }
}

fn config_error(key: &str, value: &str) -> InteropError {
    InteropError::Config {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.release_workers, 4);
        assert_eq!(config.release_thread_name, "cdata-release");
        assert_eq!(config.max_transfers_in_flight, 8);
        assert!(config.validate_streams);
    }

    #[test]
    fn overrides_apply() {
        let config = BridgeConfig::default()
            .with_overrides(env(&[
                ("CDATA_RELEASE_WORKERS", "2"),
                ("CDATA_MAX_TRANSFERS", " 16 "),
                ("CDATA_VALIDATE_STREAMS", "off"),
            ]))
            .unwrap();
        assert_eq!(config.release_workers, 2);
        assert_eq!(config.max_transfers_in_flight, 16);
        assert!(!config.validate_streams);
    }

    #[test]
    fn bad_values_rejected() {
        let err = BridgeConfig::default()
            .with_overrides(env(&[("CDATA_RELEASE_WORKERS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("CDATA_RELEASE_WORKERS"));
        assert!(BridgeConfig::default()
            .with_overrides(env(&[("CDATA_VALIDATE_STREAMS", "maybe")]))
            .is_err());
    }
}

//! Cloud relay configuration.
//!
//! Loaded from environment variables with fallback to defaults.
//!
//! | Variable                         | Default                 |
//! |----------------------------------|-------------------------|
//! | `CANOPY_BIND_ADDR`               | `0.0.0.0`               |
//! | `CANOPY_HTTP_PORT`               | `8080`                  |
//! | `CANOPY_DATABASE_PATH`           | `canopy-cloud.db`       |
//! | `CANOPY_JWT_SECRET`              | dev secret              |
//! | `CANOPY_BROKER_MODE`             | `client`                |
//! | `CANOPY_BROKER_ENDPOINTS`        | `tcp/127.0.0.1:7447`    |
//! | `CANOPY_BROKER_PREFIX`           | `canopy`                |
//! | `CANOPY_OFFLINE_THRESHOLD_SECS`  | `300`                   |
//! | `CANOPY_LIVENESS_INTERVAL_SECS`  | `60`                    |
//! | `CANOPY_PING_INTERVAL_SECS`      | `30`                    |
//! | `CANOPY_MAX_MISSED_PONGS`        | `2`                     |
//! | `CANOPY_VIEWER_QUEUE`            | `64`                    |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use canopy_bridge::{BrokerConfig, SessionMode};

/// Cloud relay configuration.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub bind_addr: String,
    pub http_port: u16,
    pub database_path: PathBuf,

    /// HMAC secret used to verify viewer tokens
    pub jwt_secret: String,

    pub broker: BrokerConfig,

    /// Silence longer than this marks a site offline
    pub offline_threshold_secs: u64,

    /// Period of the liveness pass
    pub liveness_interval_secs: u64,

    /// Viewer connection probe period
    pub ping_interval_secs: u64,

    /// Unanswered probes before a viewer is dropped
    pub max_missed_pongs: u32,

    /// Outbound queue per viewer; overflow closes the viewer
    pub viewer_queue: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            bind_addr: "0.0.0.0".to_string(),
            http_port: 8080,
            database_path: PathBuf::from("canopy-cloud.db"),
            jwt_secret: "canopy-dev-secret-change-in-production".to_string(),
            broker: BrokerConfig::default(),
            offline_threshold_secs: 300,
            liveness_interval_secs: 60,
            ping_interval_secs: 30,
            max_missed_pongs: 2,
            viewer_queue: 64,
        }
    }
}

impl CloudConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup (the process
    /// environment in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CloudConfig::default();

        let mut broker = BrokerConfig::default();
        if let Some(mode) = lookup("CANOPY_BROKER_MODE") {
            broker.mode = SessionMode::from_str(&mode)
                .map_err(|_| ConfigError::InvalidValue("CANOPY_BROKER_MODE".to_string()))?;
        }
        if let Some(endpoints) = lookup("CANOPY_BROKER_ENDPOINTS") {
            broker.connect = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(prefix) = lookup("CANOPY_BROKER_PREFIX") {
            broker.key_prefix = prefix;
        }

        let config = CloudConfig {
            bind_addr: lookup("CANOPY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            http_port: parse_or(&lookup, "CANOPY_HTTP_PORT", defaults.http_port)?,
            database_path: lookup("CANOPY_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            jwt_secret: lookup("CANOPY_JWT_SECRET").unwrap_or(defaults.jwt_secret),
            broker,
            offline_threshold_secs: parse_or(
                &lookup,
                "CANOPY_OFFLINE_THRESHOLD_SECS",
                defaults.offline_threshold_secs,
            )?,
            liveness_interval_secs: parse_or(
                &lookup,
                "CANOPY_LIVENESS_INTERVAL_SECS",
                defaults.liveness_interval_secs,
            )?,
            ping_interval_secs: parse_or(&lookup, "CANOPY_PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
            max_missed_pongs: parse_or(&lookup, "CANOPY_MAX_MISSED_PONGS", defaults.max_missed_pongs)?,
            viewer_queue: parse_or(&lookup, "CANOPY_VIEWER_QUEUE", defaults.viewer_queue)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingRequired("CANOPY_JWT_SECRET".to_string()));
        }

        if self.liveness_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("CANOPY_LIVENESS_INTERVAL_SECS".to_string()));
        }

        // A site must be able to miss at least one check before it is offline.
        if self.offline_threshold_secs <= self.liveness_interval_secs {
            return Err(ConfigError::ThresholdTooShort {
                threshold: self.offline_threshold_secs,
                interval: self.liveness_interval_secs,
            });
        }

        if self.ping_interval_secs == 0 || self.max_missed_pongs == 0 {
            return Err(ConfigError::InvalidValue("CANOPY_PING_INTERVAL_SECS".to_string()));
        }

        if self.viewer_queue == 0 {
            return Err(ConfigError::InvalidValue("CANOPY_VIEWER_QUEUE".to_string()));
        }

        self.broker
            .validate()
            .map_err(|e| ConfigError::Broker(e.to_string()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn offline_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_threshold_secs as i64)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Offline threshold ({threshold}s) must exceed the liveness interval ({interval}s)")]
    ThresholdTooShort { threshold: u64, interval: u64 },

    #[error("Invalid broker configuration: {0}")]
    Broker(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CloudConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.offline_threshold_secs, 300);
        assert_eq!(config.liveness_interval_secs, 60);
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_overrides() {
        let config = CloudConfig::from_lookup(lookup(&[
            ("CANOPY_HTTP_PORT", "9090"),
            ("CANOPY_BROKER_MODE", "peer"),
            ("CANOPY_BROKER_ENDPOINTS", "tcp/10.0.0.1:7447, tcp/10.0.0.2:7447"),
            ("CANOPY_OFFLINE_THRESHOLD_SECS", "120"),
            ("CANOPY_LIVENESS_INTERVAL_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.http_port, 9090);
        assert_eq!(config.broker.mode, SessionMode::Peer);
        assert_eq!(config.broker.connect.len(), 2);
        assert_eq!(config.offline_threshold(), chrono::Duration::seconds(120));
    }

    #[test]
    fn test_threshold_must_exceed_interval() {
        let err = CloudConfig::from_lookup(lookup(&[
            ("CANOPY_OFFLINE_THRESHOLD_SECS", "60"),
            ("CANOPY_LIVENESS_INTERVAL_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ThresholdTooShort { .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = CloudConfig::from_lookup(lookup(&[("CANOPY_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k) if k == "CANOPY_HTTP_PORT"));
        assert!(CloudConfig::from_lookup(lookup(&[("CANOPY_BROKER_MODE", "router")])).is_err());
    }
}

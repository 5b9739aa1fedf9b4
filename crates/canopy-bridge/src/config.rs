//! # Broker Configuration
//!
//! Settings shared by both tiers. The cloud loads these from `CANOPY_BROKER_*`
//! environment variables; the edge reads the `[broker]` table of its TOML file.
//!
//! ```toml
//! [broker]
//! mode = "client"                     # client | peer
//! connect = ["tcp/broker.example:7447"]
//! key_prefix = "canopy"
//! initial_backoff_ms = 500
//! max_backoff_secs = 60
//! connectivity_check_secs = 5
//! outgoing_capacity = 256
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

// =============================================================================
// Session Mode
// =============================================================================

/// How the zenoh session attaches to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Connects to one of the configured routers. Production setting.
    #[default]
    Client,
    /// Joins the mesh directly. Handy for local development.
    Peer,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Client => "client",
            SessionMode::Peer => "peer",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(SessionMode::Client),
            "peer" => Ok(SessionMode::Peer),
            other => Err(BridgeError::InvalidConfig(format!(
                "Invalid session mode '{other}'. Expected 'client' or 'peer'"
            ))),
        }
    }
}

// =============================================================================
// Broker Config
// =============================================================================

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: SessionMode,

    /// Router endpoints, e.g. `tcp/10.0.0.5:7447`.
    pub connect: Vec<String>,

    /// First path segment of every key expression.
    pub key_prefix: String,

    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,

    /// How often the open session is checked for reachable routers/peers.
    pub connectivity_check_secs: u64,

    /// Bound of the queue between `publish` and the transport task.
    pub outgoing_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            mode: SessionMode::Client,
            connect: vec!["tcp/127.0.0.1:7447".to_string()],
            key_prefix: crate::topic::DEFAULT_PREFIX.to_string(),
            initial_backoff_ms: 500,
            max_backoff_secs: 60,
            connectivity_check_secs: 5,
            outgoing_capacity: 256,
        }
    }
}

impl BrokerConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_check_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.mode == SessionMode::Client && self.connect.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "client mode requires at least one connect endpoint".to_string(),
            ));
        }

        if self.key_prefix.is_empty()
            || self
                .key_prefix
                .chars()
                .any(|c| matches!(c, '/' | '*' | '$' | '?' | '#') || c.is_whitespace())
        {
            return Err(BridgeError::InvalidConfig(format!(
                "key_prefix '{}' must be a single non-wildcard chunk",
                self.key_prefix
            )));
        }

        if self.initial_backoff_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.initial_backoff() > self.max_backoff() {
            return Err(BridgeError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_secs".to_string(),
            ));
        }

        if self.connectivity_check_secs == 0 {
            return Err(BridgeError::InvalidConfig(
                "connectivity_check_secs must be greater than 0".to_string(),
            ));
        }

        if self.outgoing_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "outgoing_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

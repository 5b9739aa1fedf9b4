//! # Topic Namespace
//!
//! Every message travels on a per-site, direction-qualified key expression:
//!
//! ```text
//!   {prefix}/{site}/{direction}/{suffix}
//!
//!   canopy/farm-01/down/command            cloud → edge
//!   canopy/farm-01/down/request/start      cloud → edge
//!   canopy/farm-01/up/telemetry            edge  → cloud
//!
//! Subscriptions
//! ─────────────
//!   cloud: canopy/*/up/**                  every site, uplink only
//!   edge:  canopy/farm-01/down/**          its own site, downlink only
//! ```
//!
//! Suffixes may span several chunks (`request/start`), so parsing splits the
//! prefix, site and direction off the front and treats the remainder as the
//! suffix.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BridgeError, BridgeResult};

/// Default first chunk of every key expression.
pub const DEFAULT_PREFIX: &str = "canopy";

// =============================================================================
// Direction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Cloud to edge.
    Down,
    /// Edge to cloud.
    Up,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Down => "down",
            Direction::Up => "up",
        }
    }
}

// =============================================================================
// Topic
// =============================================================================

/// The nine topics exchanged between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    // Cloud → Edge
    Command,
    ConfigUpdate,
    RequestStart,
    RequestStop,

    // Edge → Cloud
    Telemetry,
    Status,
    Alarm,
    Heartbeat,
    DailySummary,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Command,
        Topic::ConfigUpdate,
        Topic::RequestStart,
        Topic::RequestStop,
        Topic::Telemetry,
        Topic::Status,
        Topic::Alarm,
        Topic::Heartbeat,
        Topic::DailySummary,
    ];

    /// Key suffix after the direction chunk.
    pub fn suffix(&self) -> &'static str {
        match self {
            Topic::Command => "command",
            Topic::ConfigUpdate => "config-update",
            Topic::RequestStart => "request/start",
            Topic::RequestStop => "request/stop",
            Topic::Telemetry => "telemetry",
            Topic::Status => "status",
            Topic::Alarm => "alarm",
            Topic::Heartbeat => "heartbeat",
            Topic::DailySummary => "daily-summary",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Topic::Command | Topic::ConfigUpdate | Topic::RequestStart | Topic::RequestStop => {
                Direction::Down
            }
            Topic::Telemetry
            | Topic::Status
            | Topic::Alarm
            | Topic::Heartbeat
            | Topic::DailySummary => Direction::Up,
        }
    }

    pub fn from_suffix(direction: Direction, suffix: &str) -> Option<Topic> {
        Topic::ALL
            .into_iter()
            .find(|t| t.direction() == direction && t.suffix() == suffix)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

// =============================================================================
// Topic Space
// =============================================================================

/// Derives and parses key expressions under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpace {
    prefix: String,
}

impl Default for TopicSpace {
    fn default() -> Self {
        TopicSpace::new(DEFAULT_PREFIX)
    }
}

impl TopicSpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        TopicSpace {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Concrete key for `topic` at `site`.
    pub fn key(&self, site: &str, topic: Topic) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            site,
            topic.direction().as_str(),
            topic.suffix()
        )
    }

    /// Wildcard the cloud subscribes to: every site's uplink.
    pub fn uplink_all(&self) -> String {
        format!("{}/*/up/**", self.prefix)
    }

    /// Wildcard an edge subscribes to: its own downlink.
    pub fn downlink_for(&self, site: &str) -> String {
        format!("{}/{}/down/**", self.prefix, site)
    }

    /// Splits a concrete key into `(site, topic)`.
    pub fn parse<'k>(&self, key: &'k str) -> BridgeResult<(&'k str, Topic)> {
        let invalid = || BridgeError::InvalidKey(key.to_string());

        let mut parts = key.splitn(4, '/');
        let prefix = parts.next().ok_or_else(invalid)?;
        let site = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let direction = match parts.next() {
            Some("down") => Direction::Down,
            Some("up") => Direction::Up,
            _ => return Err(invalid()),
        };
        let suffix = parts.next().ok_or_else(invalid)?;

        if prefix != self.prefix {
            return Err(invalid());
        }

        let topic = Topic::from_suffix(direction, suffix).ok_or_else(invalid)?;
        Ok((site, topic))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

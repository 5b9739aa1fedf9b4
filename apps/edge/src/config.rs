//! # Edge Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CANOPY_SITE_NAME=north-field-02                                    │
//! │     CANOPY_BROKER_ENDPOINTS=tcp/10.0.0.5:7447                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/canopy/edge.toml (Linux)                                 │
//! │     ~/Library/Application Support/com.canopy.edge/edge.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     generated site id, 00:05 sync, 30/90 day retention                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [site]
//! id = "3f1c9b7e-0d7a-4c55-9a53-0b0f6f2b8a10"
//! name = "north-field-02"
//! channels = ["pump", "valve-1", "valve-2"]
//!
//! [broker]
//! mode = "client"
//! connect = ["tcp/10.0.0.5:7447"]
//!
//! [database]
//! path = "/var/lib/canopy/edge.db"
//!
//! [telemetry]
//! sample_interval_secs = 60
//! publish_interval_secs = 5
//!
//! [heartbeat]
//! interval_secs = 30
//!
//! [sync]
//! fire_at = "00:05"
//! catch_up_days = 7
//!
//! [retention]
//! detail_days = 30
//! alarm_days = 90
//! ```

use std::path::PathBuf;
use std::time::Duration;

use canopy_bridge::{BrokerConfig, SessionMode};
use canopy_core::validation::{parse_fire_time, validate_channel_name, validate_retention, validate_site_name};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EdgeError, EdgeResult};

// =============================================================================
// Site
// =============================================================================

/// Identity of the site this agent controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSection {
    /// Local row key for runs, readings and commands.
    /// Auto-generated on first run if not provided.
    #[serde(default = "default_site_id")]
    pub id: String,

    /// Broker-addressable name; must match the cloud's site record.
    #[serde(default = "default_site_name")]
    pub name: String,

    /// Actuator channels wired to this controller.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

fn default_site_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_site_name() -> String {
    "canopy-site".to_string()
}

fn default_channels() -> Vec<String> {
    vec![canopy_core::control::PUMP_CHANNEL.to_string(), "valve-1".to_string()]
}

impl Default for SiteSection {
    fn default() -> Self {
        SiteSection {
            id: default_site_id(),
            name: default_site_name(),
            channels: default_channels(),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("canopy-edge.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection { path: default_db_path() }
    }
}

// =============================================================================
// Telemetry & Heartbeat
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// How often a sensor reading is stored as detail data.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// How often a snapshot is published while a viewer is watching.
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,
}

fn default_sample_interval() -> u64 {
    60
}

fn default_publish_interval() -> u64 {
    5
}

impl Default for TelemetrySection {
    fn default() -> Self {
        TelemetrySection {
            sample_interval_secs: default_sample_interval(),
            publish_interval_secs: default_publish_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        HeartbeatSection {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

// =============================================================================
// Daily Sync & Retention
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Local wall-clock time of the daily firing, `HH:MM`.
    #[serde(default = "default_fire_at")]
    pub fire_at: String,

    /// Earlier days whose unsynced summaries ride along with a firing.
    #[serde(default = "default_catch_up_days")]
    pub catch_up_days: u32,
}

fn default_fire_at() -> String {
    "00:05".to_string()
}

fn default_catch_up_days() -> u32 {
    7
}

impl Default for SyncSection {
    fn default() -> Self {
        SyncSection {
            fire_at: default_fire_at(),
            catch_up_days: default_catch_up_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionSection {
    /// Sensor readings and program runs.
    #[serde(default = "default_detail_days")]
    pub detail_days: u32,

    /// Resolved alarm episodes.
    #[serde(default = "default_alarm_days")]
    pub alarm_days: u32,
}

fn default_detail_days() -> u32 {
    30
}

fn default_alarm_days() -> u32 {
    90
}

impl Default for RetentionSection {
    fn default() -> Self {
        RetentionSection {
            detail_days: default_detail_days(),
            alarm_days: default_alarm_days(),
        }
    }
}

// =============================================================================
// Edge Config
// =============================================================================

/// Complete edge agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub site: SiteSection,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub telemetry: TelemetrySection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub retention: RetentionSection,
}

impl EdgeConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (edge.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EdgeResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading edge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load edge config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> EdgeResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| EdgeError::ConfigSave("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EdgeError::ConfigSave(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| EdgeError::ConfigSave(e.to_string()))?;

        info!(?path, "Edge config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EdgeResult<()> {
        if self.site.id.trim().is_empty() {
            return Err(EdgeError::InvalidConfig("site.id is required".into()));
        }

        validate_site_name(&self.site.name)?;

        for channel in &self.site.channels {
            validate_channel_name(channel)?;
        }

        validate_retention(self.retention.detail_days, self.retention.alarm_days)?;
        parse_fire_time(&self.sync.fire_at)?;

        if self.telemetry.sample_interval_secs == 0
            || self.telemetry.publish_interval_secs == 0
            || self.heartbeat.interval_secs == 0
        {
            return Err(EdgeError::InvalidConfig("intervals must be greater than 0".into()));
        }

        self.broker
            .validate()
            .map_err(|e| EdgeError::InvalidConfig(e.to_string()))
    }

    /// Applies `CANOPY_*` environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("CANOPY_SITE_ID") {
            debug!(site_id = %id, "Overriding site id from environment");
            self.site.id = id;
        }

        if let Some(name) = lookup("CANOPY_SITE_NAME") {
            debug!(site = %name, "Overriding site name from environment");
            self.site.name = name;
        }

        if let Some(path) = lookup("CANOPY_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }

        if let Some(mode) = lookup("CANOPY_BROKER_MODE") {
            match mode.parse::<SessionMode>() {
                Ok(mode) => self.broker.mode = mode,
                Err(_) => warn!(mode = %mode, "Unknown broker mode in environment"),
            }
        }

        if let Some(endpoints) = lookup("CANOPY_BROKER_ENDPOINTS") {
            self.broker.connect = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(fire_at) = lookup("CANOPY_SYNC_FIRE_AT") {
            self.sync.fire_at = fire_at;
        }

        let numeric = |key: &str| {
            lookup(key).and_then(|raw| match raw.parse::<u32>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring non-numeric override");
                    None
                }
            })
        };

        if let Some(days) = numeric("CANOPY_DETAIL_DAYS") {
            self.retention.detail_days = days;
        }
        if let Some(days) = numeric("CANOPY_ALARM_DAYS") {
            self.retention.alarm_days = days;
        }
        if let Some(days) = numeric("CANOPY_CATCH_UP_DAYS") {
            self.sync.catch_up_days = days;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopy", "edge").map(|dirs| dirs.config_dir().join("edge.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Parsed daily fire time. Call after [`validate`](Self::validate).
    pub fn fire_at(&self) -> EdgeResult<NaiveTime> {
        Ok(parse_fire_time(&self.sync.fire_at)?)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.sample_interval_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.publish_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_default_config() {
        let config = EdgeConfig::default();
        assert!(!config.site.id.is_empty()); // Auto-generated
        assert_eq!(config.sync.fire_at, "00:05");
        assert_eq!(config.retention.detail_days, 30);
        assert_eq!(config.retention.alarm_days, 90);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EdgeConfig::default();

        config.site.name = "north/field".into();
        assert!(config.validate().is_err());
        config.site.name = "north-field".into();

        config.retention.alarm_days = 10;
        assert!(config.validate().is_err());
        config.retention.alarm_days = 90;

        config.sync.fire_at = "25:00".into();
        assert!(config.validate().is_err());
        config.sync.fire_at = "23:30".into();

        config.heartbeat.interval_secs = 0;
        assert!(config.validate().is_err());
        config.heartbeat.interval_secs = 30;

        assert!(config.validate().is_ok());
        assert_eq!(config.fire_at().unwrap(), NaiveTime::from_hms_opt(23, 30, 0).unwrap());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EdgeConfig = toml::from_str(
            r#"
            [site]
            name = "north-field-02"

            [retention]
            detail_days = 14
            "#,
        )
        .unwrap();

        assert_eq!(config.site.name, "north-field-02");
        assert_eq!(config.retention.detail_days, 14);
        assert_eq!(config.retention.alarm_days, 90);
        assert_eq!(config.telemetry.publish_interval_secs, 5);
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EdgeConfig::default();
        config.apply_overrides(lookup(&[
            ("CANOPY_SITE_NAME", "farm-07"),
            ("CANOPY_BROKER_ENDPOINTS", "tcp/10.0.0.5:7447, tcp/10.0.0.6:7447"),
            ("CANOPY_DETAIL_DAYS", "14"),
            ("CANOPY_ALARM_DAYS", "not-a-number"),
        ]));

        assert_eq!(config.site.name, "farm-07");
        assert_eq!(config.broker.connect.len(), 2);
        assert_eq!(config.retention.detail_days, 14);
        assert_eq!(config.retention.alarm_days, 90);
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir().join(format!("canopy-edge-{}.toml", Uuid::new_v4()));
        let mut config = EdgeConfig::default();
        config.site.name = "farm-11".into();
        config.sync.catch_up_days = 3;

        config.save(Some(path.clone())).unwrap();
        let loaded = EdgeConfig::load(Some(path.clone())).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.site.id, config.site.id);
        assert_eq!(loaded.sync.catch_up_days, 3);
    }
}

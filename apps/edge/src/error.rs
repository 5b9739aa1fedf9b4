//! # Edge Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Edge Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Storage       │  │     Broker              │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Db             │  │  Bridge                 │ │
//! │  │  ConfigLoad     │  │                 │  │                         │ │
//! │  │  ConfigSave     │  │                 │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Command rejections (unknown type, refused transition) are not errors at
//! this level: they become `failure` audit records.

use thiserror::Error;

/// Result type alias for edge operations.
pub type EdgeResult<T> = Result<T, EdgeError>;

#[derive(Debug, Error)]
pub enum EdgeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid edge configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoad(String),

    #[error("Failed to save config: {0}")]
    ConfigSave(String),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    #[error("Database error: {0}")]
    Db(#[from] canopy_db::DbError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] canopy_bridge::BridgeError),
}

impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::ConfigLoad(err.to_string())
    }
}

impl From<toml::de::Error> for EdgeError {
    fn from(err: toml::de::Error) -> Self {
        EdgeError::ConfigLoad(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for EdgeError {
    fn from(err: toml::ser::Error) -> Self {
        EdgeError::ConfigSave(format!("TOML serialize error: {}", err))
    }
}

impl From<canopy_core::ValidationError> for EdgeError {
    fn from(err: canopy_core::ValidationError) -> Self {
        EdgeError::InvalidConfig(err.to_string())
    }
}
